//! kuo - Kubernetes Upgrade Operator for EKS clusters.
//!
//! Watches `EKSUpgrade` resources and drives each cluster through planning,
//! preflight checks, sequential control plane upgrades, add-on updates and
//! managed node group rolling updates. Every cloud mutation is journaled in the
//! resource status first, so a restarted operator resumes instead of reissuing.

mod aws;
mod backoff;
mod cloud;
mod config;
mod controller;
mod crd;
mod credentials;
mod eks;
mod error;
mod executor;
mod k8s;
mod logging;
mod notify;
mod phases;
mod queue;
mod status;
mod store;
mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use kube::{Api, CustomResourceExt};
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::controller::Context;
use crate::credentials::CredentialBroker;
use crate::crd::EKSUpgrade;
use crate::notify::Notifier;
use crate::queue::WorkQueue;
use crate::store::KubeStore;
use crate::telemetry::health::HealthState;
use crate::telemetry::metrics::Metrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const VERSION_INFO: &str =
    const_format::concatcp!(VERSION, " (commit: ", COMMIT, ", build: ", BUILD_DATE, ")");

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if config.print_crd {
        match serde_yaml::to_string(&EKSUpgrade::crd()) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                eprintln!("Failed to render CRD: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    logging::init(&config.log_format, &config.log_level);
    info!("Starting kuo v{}", VERSION_INFO);
    config.display();

    if let Err(e) = run(config).await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Main operator loop.
async fn run(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = HealthState::new();
    let health_port = config.health_port;
    let health_server = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_server).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let mut notifiers: Vec<Arc<dyn Notifier>> =
        vec![Arc::new(notify::KubeEventNotifier::new(client.clone()))];
    if let Some(url) = config.slack_webhook_url() {
        info!("Slack notifications enabled");
        notifiers.push(Arc::new(notify::SlackNotifier::new(url.to_string())));
    }

    let api: Api<EKSUpgrade> = Api::all(client);
    let ctx = Arc::new(Context {
        store: Arc::new(KubeStore::new(api.clone())),
        broker: Arc::new(CredentialBroker::new(
            Arc::new(aws::StsIdentity::new(config.sts_region.clone())),
            config.refresh_window(),
        )),
        connector: Arc::new(aws::AwsConnector),
        notifiers,
        metrics,
        backoff: config.backoff(),
        auth_backoff: config.auth_backoff(),
    });

    let queue = WorkQueue::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ready = health_state.clone();
    let watcher = tokio::spawn(controller::watch_upgrades(
        api,
        Arc::clone(&queue),
        shutdown_rx,
        move || {
            info!("Initial EKSUpgrade list synced");
            ready.set_ready(true);
        },
    ));

    info!(workers = config.workers, "Starting EKSUpgrade controller");
    let workers = queue::run_workers(&queue, config.workers, move |name| {
        controller::reconcile_key(name, Arc::clone(&ctx))
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    health_state.set_ready(false);
    let _ = shutdown_tx.send(true);
    queue.shutdown();

    let _ = watcher.await;
    for worker in workers {
        let _ = worker.await;
    }
    info!("kuo stopped");
    Ok(())
}
