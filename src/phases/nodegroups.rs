//! Managed node group upgrade phase.
//!
//! Rolls node groups to the target version one at a time.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::step::{self, EksUpdateStep, PhaseProgress, PlannedStep};
use crate::cloud::CloudSession;
use crate::crd::{CompletionKind, EKSUpgradeSpec, EKSUpgradeStatus, UpgradePhase, nodegroup_key};
use crate::eks::UpdateScope;
use crate::executor::StepJournal;
use crate::status;

/// Requeue interval for polling in-progress nodegroup upgrades.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Execute one step of nodegroup upgrades.
pub async fn execute(
    spec: &EKSUpgradeSpec,
    current_status: &EKSUpgradeStatus,
    session: &CloudSession,
    journal: &mut dyn StepJournal,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    let mut new_status = current_status.clone();
    let plan = super::stored_plan(current_status)?;

    let steps: Vec<PlannedStep> = plan
        .nodegroups
        .iter()
        .map(|ng| PlannedStep {
            key: nodegroup_key(&ng.name),
            op: EksUpdateStep::new(
                session.eks.clone(),
                &spec.cluster_name,
                UpdateScope::Nodegroup(ng.name.clone()),
                &plan.target_version,
            ),
        })
        .collect();

    let progress = step::drive(
        &mut new_status,
        &steps,
        spec.timeouts().nodegroup(),
        POLL_INTERVAL,
        journal,
    )
    .await?;

    Ok(match progress {
        PhaseProgress::Done => {
            info!(
                "All nodegroup upgrades completed for {}",
                spec.cluster_name
            );
            status::set_phase(&mut new_status, UpgradePhase::Completed);
            new_status.completion = Some(CompletionKind::Upgraded);
            new_status.current_version = Some(plan.target_version.clone());
            status::set_condition(&mut new_status, "Ready", "True", "UpgradeCompleted", None);
            (new_status, None)
        }
        PhaseProgress::Waiting(requeue) => (new_status, Some(requeue)),
        PhaseProgress::Failed(reason) => {
            warn!(
                "Nodegroup upgrade failed for {}: {}",
                spec.cluster_name, reason
            );
            status::set_failed(
                &mut new_status,
                format!("Nodegroup upgrade failed: {reason}"),
            );
            (new_status, None)
        }
    })
}
