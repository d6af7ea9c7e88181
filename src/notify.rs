//! Notification module for upgrade lifecycle events.

pub mod events;
pub mod slack;

pub use events::KubeEventNotifier;
pub use slack::{SlackMessage, SlackNotifier};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::crd::{EKSUpgrade, EKSUpgradeSpec, EKSUpgradeStatus, UpgradePhase};

/// Kind of phase transition being reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEventKind {
    Started,
    Completed,
    Failed,
}

impl PhaseEventKind {
    /// Kind reported when entering `phase`.
    pub const fn entering(phase: UpgradePhase) -> Self {
        match phase {
            UpgradePhase::Completed => Self::Completed,
            UpgradePhase::Failed => Self::Failed,
            _ => Self::Started,
        }
    }
}

/// A phase transition of one `EKSUpgrade`, as persisted.
#[derive(Clone, Debug)]
pub struct PhaseEvent {
    pub upgrade: Arc<EKSUpgrade>,
    /// Phase that was left.
    pub from: UpgradePhase,
    pub status: EKSUpgradeStatus,
    pub kind: PhaseEventKind,
}

impl PhaseEvent {
    pub fn new(upgrade: Arc<EKSUpgrade>, from: UpgradePhase, status: EKSUpgradeStatus) -> Self {
        let kind = PhaseEventKind::entering(status.phase());
        Self {
            upgrade,
            from,
            status,
            kind,
        }
    }

    pub fn resource_name(&self) -> &str {
        self.upgrade.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn phase(&self) -> UpgradePhase {
        self.status.phase()
    }

    pub fn dry_run(&self) -> bool {
        self.upgrade.spec.dry_run
    }
}

/// Sink for phase transition events.
///
/// Delivery is best effort: a failing notifier never affects the upgrade.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &PhaseEvent) -> Result<()>;
}

/// Hand `event` to every notifier without waiting for delivery.
pub fn dispatch(notifiers: &[Arc<dyn Notifier>], event: &PhaseEvent) {
    for notifier in notifiers {
        let notifier = Arc::clone(notifier);
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                warn!(
                    notifier = notifier.name(),
                    resource = event.resource_name(),
                    error = %e,
                    "Failed to deliver phase notification"
                );
            }
        });
    }
}

/// Determine whether a notification should be sent for this spec.
pub const fn should_notify(spec: &EKSUpgradeSpec) -> bool {
    match &spec.notification {
        None => false,
        Some(config) => {
            if spec.dry_run {
                config.on_dry_run
            } else {
                config.on_upgrade
            }
        }
    }
}

const fn mode(spec: &EKSUpgradeSpec) -> &'static str {
    if spec.dry_run {
        "Dry Run"
    } else {
        "Live Upgrade"
    }
}

/// "1.31 → 1.32 → 1.33", falling back to current → target without a plan.
fn path_display(spec: &EKSUpgradeSpec, status: &EKSUpgradeStatus) -> String {
    match &status.plan {
        Some(plan) if !plan.hops.is_empty() => {
            format!("{} → {}", plan.current_version, plan.hops.join(" → "))
        }
        Some(plan) => format!("{} (sync)", plan.current_version),
        None => {
            let current = status.current_version.as_deref().unwrap_or("unknown");
            format!("{} → {}", current, spec.target_version)
        }
    }
}

fn duration_display(status: &EKSUpgradeStatus) -> String {
    match (status.started_at, status.completed_at) {
        (Some(start), Some(end)) => {
            let secs = (end - start).num_seconds().unsigned_abs();
            format!("{}m {}s", secs / 60, secs % 60)
        }
        _ => "unknown".to_string(),
    }
}

/// Build the "Started" notification message.
///
/// Sent once planning is done so the upgrade path is available.
pub fn build_started_message(
    resource_name: &str,
    spec: &EKSUpgradeSpec,
    status: &EKSUpgradeStatus,
) -> SlackMessage {
    let phases = "Planning → Preflight → ControlPlane → Addons → NodeGroups";

    SlackMessage {
        header: "EKS Upgrade Started".to_string(),
        fields: vec![
            ("Cluster".to_string(), spec.cluster_name.clone()),
            ("Region".to_string(), spec.region.clone()),
            ("Target Version".to_string(), spec.target_version.clone()),
            ("Mode".to_string(), mode(spec).to_string()),
            ("Upgrade Path".to_string(), path_display(spec, status)),
            ("Phases".to_string(), phases.to_string()),
        ],
        context: format!("Sent by kuo via EKSUpgrade/{resource_name}"),
    }
}

/// Build the "Completed" notification message.
pub fn build_completed_message(
    resource_name: &str,
    spec: &EKSUpgradeSpec,
    status: &EKSUpgradeStatus,
) -> SlackMessage {
    SlackMessage {
        header: "EKS Upgrade Completed".to_string(),
        fields: vec![
            ("Cluster".to_string(), spec.cluster_name.clone()),
            ("Mode".to_string(), mode(spec).to_string()),
            ("Upgrade Path".to_string(), path_display(spec, status)),
            ("Duration".to_string(), duration_display(status)),
        ],
        context: format!("Sent by kuo via EKSUpgrade/{resource_name}"),
    }
}

/// Build the "Failed" notification message.
///
/// `failed_phase` is the phase the run was in when it failed.
pub fn build_failed_message(
    resource_name: &str,
    spec: &EKSUpgradeSpec,
    status: &EKSUpgradeStatus,
    failed_phase: &str,
) -> SlackMessage {
    let error = status.error_message.as_deref().unwrap_or("unknown error");

    SlackMessage {
        header: "EKS Upgrade Failed".to_string(),
        fields: vec![
            ("Cluster".to_string(), spec.cluster_name.clone()),
            ("Mode".to_string(), mode(spec).to_string()),
            ("Failed Phase".to_string(), failed_phase.to_string()),
            ("Duration".to_string(), duration_display(status)),
            ("Error".to_string(), error.to_string()),
        ],
        context: format!("Sent by kuo via EKSUpgrade/{resource_name}"),
    }
}
