//! Status mutation helpers and condition builders.

use chrono::Utc;

use crate::crd::{EKSUpgradeStatus, UpgradeCondition, UpgradePhase};

/// Set the phase on a status, preserving other fields.
///
/// Stamps `phase_started_at` so phase durations survive restarts.
pub fn set_phase(status: &mut EKSUpgradeStatus, phase: UpgradePhase) {
    let now = Utc::now();
    if phase.is_terminal() {
        status.completed_at = Some(now);
    }
    status.phase = Some(phase);
    status.phase_started_at = Some(now);
}

/// Set the phase to Failed with a message.
pub fn set_failed(status: &mut EKSUpgradeStatus, message: impl Into<String>) {
    let message = message.into();
    set_phase(status, UpgradePhase::Failed);
    status.error_message = Some(message.clone());
    set_condition(status, "Ready", "False", "UpgradeFailed", Some(message));
}

/// Set a condition on the status.
pub fn set_condition(
    status: &mut EKSUpgradeStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
) {
    let now = Utc::now();

    // Remove existing condition of same type
    status.conditions.retain(|c| c.r#type != condition_type);

    status.conditions.push(UpgradeCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: now,
    });
}

/// Start over for a new spec generation.
///
/// Keeps what describes the account rather than the run: auth state,
/// caller identity and the `AWSAuthenticated` condition.
pub fn reset_for_generation(status: &EKSUpgradeStatus, generation: i64) -> EKSUpgradeStatus {
    EKSUpgradeStatus {
        auth_state: status.auth_state,
        identity: status.identity.clone(),
        conditions: status
            .conditions
            .iter()
            .filter(|c| c.r#type == "AWSAuthenticated")
            .cloned()
            .collect(),
        observed_generation: generation,
        ..Default::default()
    }
}
