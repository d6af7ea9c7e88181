//! `EKSUpgrade` spec types.

use std::collections::HashMap;

use chrono::TimeDelta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::EKSUpgradeStatus;

/// `EKSUpgrade` spec defines the desired state of an EKS cluster upgrade.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kuo.io",
    version = "v1alpha1",
    kind = "EKSUpgrade",
    status = "EKSUpgradeStatus",
    printcolumn = r#"{"name":"CLUSTER","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"TARGET","type":"string","jsonPath":".spec.targetVersion"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AUTH","type":"string","jsonPath":".status.authState"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EKSUpgradeSpec {
    /// Name of the EKS cluster to upgrade.
    pub cluster_name: String,

    /// Target Kubernetes version (e.g., "1.34").
    pub target_version: String,

    /// AWS region where the cluster resides.
    pub region: String,

    /// IAM Role ARN to assume for cross-account access.
    /// Works with both IRSA and EKS Pod Identity as the base credential source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role_arn: Option<String>,

    /// Optional add-on version overrides (addon name -> version).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addon_versions: Option<HashMap<String, String>>,

    /// Skip the PodDisruptionBudget check during preflight.
    #[serde(default)]
    pub skip_pdb_check: bool,

    /// Plan and validate only, never mutate the cluster.
    #[serde(default)]
    pub dry_run: bool,

    /// Per-step timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutConfig>,

    /// Slack notification configuration for this upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationConfig>,
}

impl EKSUpgradeSpec {
    /// Effective timeouts, falling back to defaults when unset.
    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts.clone().unwrap_or_default()
    }
}

/// Slack notification configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    /// Send Slack notifications for actual upgrades (dryRun: false).
    #[serde(default)]
    pub on_upgrade: bool,
    /// Send Slack notifications for dry-run executions (dryRun: true).
    #[serde(default)]
    pub on_dry_run: bool,
}

/// Timeout configuration, applied to each step of the matching category.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Control plane hop timeout in minutes (default: 30).
    #[serde(default = "default_cp_timeout")]
    pub control_plane_minutes: u64,

    /// Add-on update timeout in minutes (default: 15).
    #[serde(default = "default_addon_timeout")]
    pub addon_minutes: u64,

    /// Node group rolling update timeout in minutes (default: 60).
    #[serde(default = "default_ng_timeout")]
    pub nodegroup_minutes: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            control_plane_minutes: default_cp_timeout(),
            addon_minutes: default_addon_timeout(),
            nodegroup_minutes: default_ng_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn control_plane(&self) -> TimeDelta {
        minutes(self.control_plane_minutes)
    }

    pub fn addon(&self) -> TimeDelta {
        minutes(self.addon_minutes)
    }

    pub fn nodegroup(&self) -> TimeDelta {
        minutes(self.nodegroup_minutes)
    }
}

fn minutes(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .unwrap_or(TimeDelta::MAX)
}

const fn default_cp_timeout() -> u64 {
    30
}
const fn default_addon_timeout() -> u64 {
    15
}
const fn default_ng_timeout() -> u64 {
    60
}
