//! Add-on upgrade phase.
//!
//! Upgrades add-ons one at a time, polling status between reconciles.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::step::{self, EksUpdateStep, PhaseProgress, PlannedStep};
use crate::cloud::CloudSession;
use crate::crd::{EKSUpgradeSpec, EKSUpgradeStatus, UpgradePhase, addon_key};
use crate::eks::UpdateScope;
use crate::executor::StepJournal;
use crate::status;

/// Requeue interval for polling in-progress addon upgrades.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Execute one step of addon upgrades.
pub async fn execute(
    spec: &EKSUpgradeSpec,
    current_status: &EKSUpgradeStatus,
    session: &CloudSession,
    journal: &mut dyn StepJournal,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    let mut new_status = current_status.clone();
    let plan = super::stored_plan(current_status)?;

    let steps: Vec<PlannedStep> = plan
        .addons
        .iter()
        .map(|addon| PlannedStep {
            key: addon_key(&addon.name),
            op: EksUpdateStep::new(
                session.eks.clone(),
                &spec.cluster_name,
                UpdateScope::Addon(addon.name.clone()),
                &addon.target_version,
            ),
        })
        .collect();

    let progress = step::drive(
        &mut new_status,
        &steps,
        spec.timeouts().addon(),
        POLL_INTERVAL,
        journal,
    )
    .await?;

    Ok(match progress {
        PhaseProgress::Done => {
            info!("All addon upgrades completed for {}", spec.cluster_name);
            status::set_phase(&mut new_status, UpgradePhase::UpgradingNodeGroups);
            (new_status, Some(Duration::ZERO))
        }
        PhaseProgress::Waiting(requeue) => (new_status, Some(requeue)),
        PhaseProgress::Failed(reason) => {
            warn!("Addon upgrade failed for {}: {}", spec.cluster_name, reason);
            status::set_failed(&mut new_status, format!("Addon upgrade failed: {reason}"));
            (new_status, None)
        }
    })
}
