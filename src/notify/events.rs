//! Kubernetes Events on the `EKSUpgrade` object.

use anyhow::Result;
use async_trait::async_trait;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use super::{Notifier, PhaseEvent, PhaseEventKind};
use crate::crd::UpgradePhase;

pub struct KubeEventNotifier {
    recorder: Recorder,
}

impl KubeEventNotifier {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "kuo".into(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

/// Event published for a phase transition.
pub fn event_for(event: &PhaseEvent) -> Event {
    let spec = &event.upgrade.spec;
    let (type_, reason, note) = match event.kind {
        PhaseEventKind::Started if event.phase() == UpgradePhase::Planning => (
            EventType::Normal,
            "UpgradeStarted",
            format!(
                "Starting upgrade of {} to {}{}",
                spec.cluster_name,
                spec.target_version,
                if spec.dry_run { " (dry run)" } else { "" }
            ),
        ),
        PhaseEventKind::Started => (
            EventType::Normal,
            "PhaseStarted",
            format!("{} -> {}", event.from, event.phase()),
        ),
        PhaseEventKind::Completed => (
            EventType::Normal,
            "UpgradeCompleted",
            if event.dry_run() {
                "Dry-run completed, no changes made".to_string()
            } else {
                format!(
                    "{} upgraded to {}",
                    spec.cluster_name, spec.target_version
                )
            },
        ),
        PhaseEventKind::Failed => (
            EventType::Warning,
            "UpgradeFailed",
            event
                .status
                .error_message
                .clone()
                .unwrap_or_else(|| "Upgrade failed".to_string()),
        ),
    };
    Event {
        type_,
        reason: reason.into(),
        note: Some(note),
        action: event.phase().to_string(),
        secondary: None,
    }
}

#[async_trait]
impl Notifier for KubeEventNotifier {
    fn name(&self) -> &'static str {
        "kubernetes-events"
    }

    async fn notify(&self, event: &PhaseEvent) -> Result<()> {
        let reference = event.upgrade.object_ref(&());
        self.recorder.publish(&event_for(event), &reference).await?;
        Ok(())
    }
}
