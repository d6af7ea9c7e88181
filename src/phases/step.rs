//! EKS update steps and the sequential driver shared by the upgrade phases.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::cloud::EksApi;
use crate::crd::{EKSUpgradeStatus, StepState};
use crate::eks::update::find_matching;
use crate::eks::{UpdateScope, UpdateStatus};
use crate::executor::{self, Progress, StepJournal, StepOperation};

/// Requeue interval while a step waits for its update to show up in history.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(15);

/// One EKS version update (control plane, add-on or node group).
pub struct EksUpdateStep {
    eks: Arc<dyn EksApi>,
    cluster: String,
    scope: UpdateScope,
    version: String,
}

impl EksUpdateStep {
    pub fn new(eks: Arc<dyn EksApi>, cluster: &str, scope: UpdateScope, version: &str) -> Self {
        Self {
            eks,
            cluster: cluster.to_string(),
            scope,
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl StepOperation for EksUpdateStep {
    async fn issue(&self) -> Result<String> {
        match &self.scope {
            UpdateScope::Cluster => {
                self.eks
                    .update_cluster_version(&self.cluster, &self.version)
                    .await
            }
            UpdateScope::Addon(name) => {
                self.eks
                    .update_addon(&self.cluster, name, &self.version)
                    .await
            }
            UpdateScope::Nodegroup(name) => {
                self.eks
                    .update_nodegroup_version(&self.cluster, name, &self.version)
                    .await
            }
        }
    }

    async fn poll(&self, operation_id: &str) -> Result<Progress> {
        let update = self
            .eks
            .describe_update(&self.cluster, &self.scope, operation_id)
            .await?;
        debug!(
            "Update {} for {} {}: {:?}",
            operation_id, self.cluster, self.scope, update.status
        );
        Ok(match update.status {
            UpdateStatus::InProgress => Progress::Running,
            UpdateStatus::Successful => Progress::Succeeded,
            UpdateStatus::Failed | UpdateStatus::Cancelled => {
                Progress::Failed(update.failure_message())
            }
        })
    }

    async fn recover(&self, since: DateTime<Utc>) -> Result<Option<String>> {
        let updates = self.eks.list_updates(&self.cluster, &self.scope).await?;
        Ok(find_matching(&updates, &self.version, since).map(|u| u.id.clone()))
    }
}

/// A step of a phase, in execution order.
pub struct PlannedStep {
    pub key: String,
    pub op: EksUpdateStep,
}

/// Outcome of driving a phase's steps for one reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseProgress {
    /// Every step succeeded.
    Done,
    /// Requeue after the given delay.
    Waiting(Duration),
    /// A step failed; the message names the step.
    Failed(String),
}

/// Advance the first unfinished step. Steps run strictly one after another:
/// a step is only started once every earlier step has succeeded.
pub async fn drive(
    status: &mut EKSUpgradeStatus,
    steps: &[PlannedStep],
    timeout: TimeDelta,
    poll_interval: Duration,
    journal: &mut dyn StepJournal,
) -> Result<PhaseProgress> {
    for step in steps {
        if status
            .handle(&step.key)
            .is_some_and(|h| h.state == StepState::Succeeded)
        {
            continue;
        }

        let state = executor::advance(
            &mut status.step_handles,
            &step.key,
            timeout,
            &step.op,
            journal,
        )
        .await?;

        return Ok(match state {
            // Persist before starting the next step.
            StepState::Succeeded => PhaseProgress::Waiting(Duration::ZERO),
            StepState::InProgress => PhaseProgress::Waiting(poll_interval),
            StepState::Issuing => PhaseProgress::Waiting(RECOVERY_INTERVAL),
            StepState::Failed => {
                let reason = status
                    .handle(&step.key)
                    .and_then(|h| h.error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                warn!("Step {} failed: {}", step.key, reason);
                PhaseProgress::Failed(format!("step {} failed: {reason}", step.key))
            }
        });
    }
    Ok(PhaseProgress::Done)
}
