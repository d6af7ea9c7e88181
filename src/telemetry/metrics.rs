//! Prometheus metrics for the kuo operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::crd::{StepState, UpgradePhase};

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub cluster_name: String,
    pub region: String,
    pub result: String,
}

/// Labels for upgrade metrics (cluster-level).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpgradeLabels {
    pub cluster_name: String,
    pub region: String,
}

/// Labels for phase metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub cluster_name: String,
    pub region: String,
    pub phase: String,
}

/// Labels for step outcome metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub cluster_name: String,
    pub region: String,
    /// `controlplane`, `addon` or `nodegroup`.
    pub kind: String,
    pub outcome: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<UpgradeLabels, Histogram>,
    pub upgrade_phase_info: Family<PhaseLabels, Gauge>,
    pub upgrade_completed_total: Family<UpgradeLabels, Counter>,
    pub upgrade_failed_total: Family<UpgradeLabels, Counter>,
    pub phase_transition_total: Family<PhaseLabels, Counter>,
    pub phase_duration_seconds: Family<PhaseLabels, Histogram>,
    pub step_outcome_total: Family<StepLabels, Counter>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for phase duration (1s to 2h): phases like UpgradingControlPlane
/// or UpgradingNodeGroups can take tens of minutes.
const PHASE_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "kuo_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<UpgradeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "kuo_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let upgrade_phase_info = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "kuo_upgrade_phase_info",
            "Current upgrade phase (1=active, 0=inactive)",
            upgrade_phase_info.clone(),
        );

        let upgrade_completed_total = Family::<UpgradeLabels, Counter>::default();
        registry.register(
            "kuo_upgrade_completed",
            "Total number of upgrades that reached Completed phase",
            upgrade_completed_total.clone(),
        );

        let upgrade_failed_total = Family::<UpgradeLabels, Counter>::default();
        registry.register(
            "kuo_upgrade_failed",
            "Total number of upgrades that reached Failed phase",
            upgrade_failed_total.clone(),
        );

        let phase_transition_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "kuo_phase_transition",
            "Total number of phase transitions",
            phase_transition_total.clone(),
        );

        let phase_duration_seconds = Family::<PhaseLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(PHASE_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "kuo_phase_duration_seconds",
            "Time spent in each upgrade phase in seconds",
            phase_duration_seconds.clone(),
        );

        let step_outcome_total = Family::<StepLabels, Counter>::default();
        registry.register(
            "kuo_step_outcome",
            "Total number of upgrade steps that finished, by outcome",
            step_outcome_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            upgrade_phase_info,
            upgrade_completed_total,
            upgrade_failed_total,
            phase_transition_total,
            phase_duration_seconds,
            step_outcome_total,
        }
    }

    pub fn record_reconcile(&self, cluster_name: &str, region: &str, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                cluster_name: cluster_name.to_string(),
                region: region.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&upgrade_labels(cluster_name, region))
            .observe(seconds);
    }

    /// Record a phase change. The time spent in `from` is measured from its
    /// persisted start, so it survives operator restarts.
    pub fn record_transition(
        &self,
        cluster_name: &str,
        region: &str,
        from: UpgradePhase,
        to: UpgradePhase,
        from_started_at: Option<DateTime<Utc>>,
    ) {
        let labels = |phase: UpgradePhase| PhaseLabels {
            cluster_name: cluster_name.to_string(),
            region: region.to_string(),
            phase: phase.to_string(),
        };

        if let Some(started) = from_started_at {
            let seconds = (Utc::now() - started)
                .to_std()
                .map_or(0.0, |d| d.as_secs_f64());
            self.phase_duration_seconds
                .get_or_create(&labels(from))
                .observe(seconds);
        }
        self.upgrade_phase_info.get_or_create(&labels(from)).set(0);
        self.upgrade_phase_info.get_or_create(&labels(to)).set(1);
        self.phase_transition_total.get_or_create(&labels(to)).inc();

        match to {
            UpgradePhase::Completed => {
                self.upgrade_completed_total
                    .get_or_create(&upgrade_labels(cluster_name, region))
                    .inc();
            }
            UpgradePhase::Failed => {
                self.upgrade_failed_total
                    .get_or_create(&upgrade_labels(cluster_name, region))
                    .inc();
            }
            _ => {}
        }
    }

    /// Count a step that reached a terminal state. `key` is the step key.
    pub fn record_step(&self, cluster_name: &str, region: &str, key: &str, state: StepState) {
        let kind = key.split_once(':').map_or(key, |(kind, _)| kind);
        self.step_outcome_total
            .get_or_create(&StepLabels {
                cluster_name: cluster_name.to_string(),
                region: region.to_string(),
                kind: kind.to_string(),
                outcome: state.to_string(),
            })
            .inc();
    }
}

fn upgrade_labels(cluster_name: &str, region: &str) -> UpgradeLabels {
    UpgradeLabels {
        cluster_name: cluster_name.to_string(),
        region: region.to_string(),
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
