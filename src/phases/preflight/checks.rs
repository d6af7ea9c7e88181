//! Preflight check results for EKS upgrade validation.

use crate::crd::{CheckResult, PreflightCheckStatus};
use crate::eks::InsightsSummary;
use crate::k8s::DisruptionBudget;

pub const CLUSTER_INSIGHTS: &str = "EKS Cluster Insights";
pub const DELETION_PROTECTION: &str = "EKS Deletion Protection";
pub const PDB_DRAIN_DEADLOCK: &str = "PDB Drain Deadlock";

/// A single preflight check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightCheckResult {
    pub name: &'static str,
    pub status: CheckResult,
    pub summary: String,
}

/// Aggregated results of all preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightResults {
    pub checks: Vec<PreflightCheckResult>,
}

// ============================================================================
// Builder functions
// ============================================================================

impl PreflightCheckResult {
    /// Build an EKS Cluster Insights check result.
    pub fn cluster_insights(summary: &InsightsSummary) -> Self {
        let (status, summary) = if summary.has_critical_blockers() {
            let names = summary
                .critical
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            (
                CheckResult::Fail,
                format!(
                    "{} critical insight(s) found that may block upgrade: {} ({} total: {} warning, {} passing)",
                    summary.critical.len(),
                    names,
                    summary.total,
                    summary.warning_count,
                    summary.passing_count,
                ),
            )
        } else {
            (
                CheckResult::Pass,
                format!(
                    "No critical insights ({} total: {} warning, {} passing)",
                    summary.total, summary.warning_count, summary.passing_count,
                ),
            )
        };
        Self {
            name: CLUSTER_INSIGHTS,
            status,
            summary,
        }
    }

    /// Build a deletion protection check result. An unknown flag counts as
    /// disabled.
    pub fn deletion_protection(enabled: Option<bool>) -> Self {
        let (status, summary) = match enabled {
            Some(true) => (CheckResult::Pass, "Deletion protection is enabled".into()),
            Some(false) => (CheckResult::Fail, "Deletion protection is disabled".into()),
            None => (
                CheckResult::Fail,
                "Deletion protection status could not be determined".into(),
            ),
        };
        Self {
            name: DELETION_PROTECTION,
            status,
            summary,
        }
    }

    /// Build a PDB drain deadlock check result.
    pub fn pdb_drain_deadlock(budgets: &[DisruptionBudget]) -> Self {
        let blocking = crate::k8s::blocking_budgets(budgets);
        let (status, summary) = if blocking.is_empty() {
            (
                CheckResult::Pass,
                format!("No blocking PDBs ({} checked)", budgets.len()),
            )
        } else {
            let names = blocking
                .iter()
                .map(|b| b.qualified_name())
                .collect::<Vec<_>>()
                .join(", ");
            (
                CheckResult::Fail,
                format!(
                    "{} PDB(s) allow zero disruptions and would block node drain: {}",
                    blocking.len(),
                    names
                ),
            )
        };
        Self {
            name: PDB_DRAIN_DEADLOCK,
            status,
            summary,
        }
    }

    pub fn pdb_drain_deadlock_skipped() -> Self {
        Self {
            name: PDB_DRAIN_DEADLOCK,
            status: CheckResult::Skip,
            summary: "skipped by user".into(),
        }
    }
}

impl PreflightResults {
    pub fn passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckResult::Fail)
    }

    /// One entry per failed check, attributed by check name.
    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckResult::Fail)
            .map(|c| format!("{}: {}", c.name, c.summary))
            .collect()
    }

    pub fn to_status(&self) -> Vec<PreflightCheckStatus> {
        self.checks
            .iter()
            .map(|c| PreflightCheckStatus {
                name: c.name.to_string(),
                status: c.status,
                message: c.summary.clone(),
            })
            .collect()
    }
}
