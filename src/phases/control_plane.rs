//! Control plane upgrade phase.
//!
//! Upgrades one minor version per hop, in plan order. A hop is only issued
//! after the previous one succeeded.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::step::{self, EksUpdateStep, PhaseProgress, PlannedStep};
use crate::cloud::CloudSession;
use crate::crd::{EKSUpgradeSpec, EKSUpgradeStatus, StepState, UpgradePhase};
use crate::eks::UpdateScope;
use crate::executor::StepJournal;
use crate::status;

/// Requeue interval for polling in-progress control plane upgrades.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Execute one step of the control plane upgrade.
pub async fn execute(
    spec: &EKSUpgradeSpec,
    current_status: &EKSUpgradeStatus,
    session: &CloudSession,
    journal: &mut dyn StepJournal,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    let mut new_status = current_status.clone();
    let plan = super::stored_plan(current_status)?;
    let hops = plan.control_plane_hops();

    let steps: Vec<PlannedStep> = hops
        .iter()
        .map(|hop| PlannedStep {
            key: hop.key.clone(),
            op: EksUpdateStep::new(
                session.eks.clone(),
                &spec.cluster_name,
                UpdateScope::Cluster,
                &hop.to,
            ),
        })
        .collect();

    let progress = step::drive(
        &mut new_status,
        &steps,
        spec.timeouts().control_plane(),
        POLL_INTERVAL,
        journal,
    )
    .await?;

    if let Some(hop) = hops.iter().rev().find(|hop| {
        new_status
            .handle(&hop.key)
            .is_some_and(|h| h.state == StepState::Succeeded)
    }) && new_status.current_version.as_deref() != Some(hop.to.as_str())
    {
        info!(
            "Control plane of {} upgraded: {} to {}",
            spec.cluster_name, hop.from, hop.to
        );
        new_status.current_version = Some(hop.to.clone());
    }

    Ok(match progress {
        PhaseProgress::Done => {
            info!("Control plane upgrade completed for {}", spec.cluster_name);
            status::set_phase(&mut new_status, UpgradePhase::UpgradingAddons);
            (new_status, Some(Duration::ZERO))
        }
        PhaseProgress::Waiting(requeue) => (new_status, Some(requeue)),
        PhaseProgress::Failed(reason) => {
            warn!(
                "Control plane upgrade failed for {}: {}",
                spec.cluster_name, reason
            );
            status::set_failed(
                &mut new_status,
                format!("Control plane upgrade failed: {reason}"),
            );
            (new_status, None)
        }
    })
}
