//! Upgrade phase implementations.
//!
//! Each phase reads the current status and advances at most one step per
//! reconcile.

pub mod addons;
pub mod control_plane;
pub mod nodegroups;
pub mod planning;
pub mod preflight;
pub mod step;

use anyhow::{Result, anyhow};

use crate::crd::{EKSUpgradeStatus, UpgradePlan};

/// The stored plan; upgrade phases never run without one.
fn stored_plan(status: &EKSUpgradeStatus) -> Result<UpgradePlan> {
    status
        .plan
        .clone()
        .ok_or_else(|| anyhow!("upgrade plan must be set before this phase"))
}
