//! `EKSUpgrade` status types.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AuthState, CheckResult, CompletionKind, StepState, UpgradePhase};

// ============================================================================
// Plan
// ============================================================================

/// Resolved add-on upgrade target.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonTarget {
    pub name: String,
    pub current_version: String,
    pub target_version: String,
}

/// Managed node group upgrade target.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodegroupTarget {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
}

/// Upgrade plan, computed once per spec generation.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlan {
    /// Control plane version when the plan was made.
    pub current_version: String,
    pub target_version: String,
    /// Ordered single-minor control plane hops (e.g., `["1.32", "1.33"]`).
    #[serde(default)]
    pub hops: Vec<String>,
    #[serde(default)]
    pub addons: Vec<AddonTarget>,
    #[serde(default)]
    pub nodegroups: Vec<NodegroupTarget>,
}

/// One control plane hop with its step key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneHop {
    pub key: String,
    pub from: String,
    pub to: String,
}

impl UpgradePlan {
    /// Sync mode: the control plane is already at the target version.
    pub fn is_sync(&self) -> bool {
        self.hops.is_empty()
    }

    /// Hops in plan order, each paired with its stable step key.
    pub fn control_plane_hops(&self) -> Vec<ControlPlaneHop> {
        let mut from = self.current_version.clone();
        self.hops
            .iter()
            .map(|to| {
                let hop = ControlPlaneHop {
                    key: control_plane_key(&from, to),
                    from: from.clone(),
                    to: to.clone(),
                };
                from.clone_from(to);
                hop
            })
            .collect()
    }
}

pub fn control_plane_key(from: &str, to: &str) -> String {
    format!("controlplane:{from}→{to}")
}

pub fn addon_key(name: &str) -> String {
    format!("addon:{name}")
}

pub fn nodegroup_key(name: &str) -> String {
    format!("nodegroup:{name}")
}

// ============================================================================
// Step handles
// ============================================================================

/// Persisted progress of one cloud mutation.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepHandle {
    /// AWS update ID. Absent while the step is still `Issuing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub state: StepState,
    pub started_at: DateTime<Utc>,
    /// Wall-clock deadline; an unfinished step past it is failed.
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepHandle {
    /// Write-ahead intent recorded before the mutating call.
    pub fn issuing(now: DateTime<Utc>, timeout: TimeDelta) -> Self {
        Self {
            operation_id: None,
            state: StepState::Issuing,
            started_at: now,
            deadline: now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
            completed_at: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.state = StepState::Succeeded;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.state = StepState::Failed;
        self.completed_at = Some(now);
        self.error = Some(error.into());
    }
}

// ============================================================================
// Conditions, identity, preflight
// ============================================================================

/// Condition on the `EKSUpgrade` resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// AWS caller identity resolved via STS `GetCallerIdentity`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsIdentity {
    /// AWS account ID.
    pub account_id: String,
    /// IAM ARN used for API calls.
    pub arn: String,
}

/// Result of a single preflight check.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheckStatus {
    pub name: String,
    pub status: CheckResult,
    pub message: String,
}

// ============================================================================
// Top-level status
// ============================================================================

/// `EKSUpgrade` status defines the observed state of the upgrade.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EKSUpgradeStatus {
    /// Current phase of the upgrade process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<UpgradePhase>,

    #[serde(default)]
    pub auth_state: AuthState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<UpgradePlan>,

    /// Step key -> handle. Keys: `controlplane:<from>→<to>`, `addon:<name>`,
    /// `nodegroup:<name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_handles: BTreeMap<String, StepHandle>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Spec generation this status belongs to.
    #[serde(default)]
    pub observed_generation: i64,

    /// Current Kubernetes version of the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preflight: Vec<PreflightCheckStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<UpgradeCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<AwsIdentity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionKind>,

    /// Consecutive transient failures; reset by any successful reconcile.
    #[serde(default)]
    pub transient_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EKSUpgradeStatus {
    pub fn phase(&self) -> UpgradePhase {
        self.phase.unwrap_or(UpgradePhase::Pending)
    }

    pub fn handle(&self, key: &str) -> Option<&StepHandle> {
        self.step_handles.get(key)
    }
}
