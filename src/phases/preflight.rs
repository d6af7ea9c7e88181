//! Preflight checking phase.
//!
//! Runs mandatory pre-upgrade validations before proceeding:
//! - EKS Cluster Insights: checks for critical upgrade blockers via EKS Insights API.
//! - EKS Deletion Protection: cluster must have deletion protection enabled.
//! - PDB Drain Deadlock: no PDB with `disruptionsAllowed == 0` (unless skipped).
//!
//! Every check runs even after another failed. API errors are not check
//! failures: they abort the phase and the reconcile is retried.

pub mod checks;

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::cloud::CloudSession;
use crate::crd::{CompletionKind, EKSUpgradeSpec, EKSUpgradeStatus, UpgradePhase};
use crate::eks::ClusterInfo;
use crate::status;

use self::checks::{PreflightCheckResult, PreflightResults};

/// Run all preflight checks against a cluster.
pub async fn run_preflight(
    session: &CloudSession,
    cluster: &ClusterInfo,
    skip_pdb_check: bool,
) -> Result<PreflightResults> {
    let mut results = PreflightResults::default();

    // ---- EKS Cluster Insights check ----
    let insights = session.eks.list_insights(&cluster.name).await?;
    for finding in &insights.critical {
        let resources = finding
            .resources
            .iter()
            .map(|r| format!("{}:{}", r.resource_type, r.resource_id))
            .collect::<Vec<_>>()
            .join(", ");
        warn!(
            "Critical insight: {} ({}) [resources: {}]{}",
            finding.description,
            finding.category,
            if resources.is_empty() { "none" } else { &resources },
            finding
                .recommendation
                .as_ref()
                .map_or(String::new(), |r| format!(" recommendation: {r}")),
        );
    }
    results
        .checks
        .push(PreflightCheckResult::cluster_insights(&insights));

    // ---- Deletion Protection check ----
    results
        .checks
        .push(PreflightCheckResult::deletion_protection(
            cluster.deletion_protection,
        ));

    // ---- PDB Drain Deadlock check ----
    if skip_pdb_check {
        results
            .checks
            .push(PreflightCheckResult::pdb_drain_deadlock_skipped());
    } else {
        let budgets = session
            .disruption_budgets(cluster)
            .await?
            .list_disruption_budgets()
            .await?;
        results
            .checks
            .push(PreflightCheckResult::pdb_drain_deadlock(&budgets));
    }

    for check in &results.checks {
        info!("[{}] {}: {}", check.status, check.name, check.summary);
    }
    Ok(results)
}

/// Execute the preflight checking phase.
pub async fn execute(
    spec: &EKSUpgradeSpec,
    current_status: &EKSUpgradeStatus,
    session: &CloudSession,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    info!("Running preflight checks for {}", spec.cluster_name);

    let cluster = session.eks.describe_cluster(&spec.cluster_name).await?;
    let results = run_preflight(session, &cluster, spec.skip_pdb_check).await?;

    let mut new_status = current_status.clone();
    new_status.preflight = results.to_status();

    if !results.passed() {
        status::set_failed(
            &mut new_status,
            format!("Preflight check failed: {}", results.failures().join("; ")),
        );
        return Ok((new_status, None));
    }

    // Dry-run: preflight passed, stop without executing upgrades
    if spec.dry_run {
        status::set_phase(&mut new_status, UpgradePhase::Completed);
        new_status.completion = Some(CompletionKind::DryRun);
        status::set_condition(
            &mut new_status,
            "Ready",
            "True",
            "DryRunCompleted",
            Some("Dry-run: preflight passed, plan generated but not executed".to_string()),
        );
        return Ok((new_status, None));
    }

    let sync = new_status.plan.as_ref().is_none_or(|p| p.is_sync());
    if sync {
        info!(
            "{} already at {}, refreshing add-ons and node groups",
            spec.cluster_name, spec.target_version
        );
        status::set_phase(&mut new_status, UpgradePhase::UpgradingAddons);
    } else {
        status::set_phase(&mut new_status, UpgradePhase::UpgradingControlPlane);
    }
    Ok((new_status, Some(Duration::ZERO)))
}
