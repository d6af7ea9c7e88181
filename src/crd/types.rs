//! Enum types for upgrade phases, authentication and step states.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of the upgrade process.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum UpgradePhase {
    Pending,
    Planning,
    PreflightChecking,
    UpgradingControlPlane,
    UpgradingAddons,
    UpgradingNodeGroups,
    Completed,
    Failed,
}

impl UpgradePhase {
    /// Completed or Failed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases that issue cloud mutations.
    pub const fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::UpgradingControlPlane | Self::UpgradingAddons | Self::UpgradingNodeGroups
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Planning => "Planning",
            Self::PreflightChecking => "PreflightChecking",
            Self::UpgradingControlPlane => "UpgradingControlPlane",
            Self::UpgradingAddons => "UpgradingAddons",
            Self::UpgradingNodeGroups => "UpgradingNodeGroups",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of AWS authentication for the target account.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AuthState {
    #[default]
    Unverified,
    IdentityVerified,
    AssumeRoleSuccess,
    AssumeRoleFailed,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unverified => "Unverified",
            Self::IdentityVerified => "IdentityVerified",
            Self::AssumeRoleSuccess => "AssumeRoleSuccess",
            Self::AssumeRoleFailed => "AssumeRoleFailed",
        };
        f.write_str(s)
    }
}

/// State of a single cloud mutation step.
///
/// `Issuing` is written before the mutating call is sent, so a crash between
/// the call and the next status write can be resolved from the cloud's
/// update history instead of re-sending the call.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum StepState {
    Issuing,
    InProgress,
    Succeeded,
    Failed,
}

impl StepState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Issuing => "Issuing",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// How a `Completed` run finished.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CompletionKind {
    Upgraded,
    DryRun,
}

/// Outcome of one preflight check.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CheckResult {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pass => "Pass",
            Self::Fail => "Fail",
            Self::Skip => "Skip",
        };
        f.write_str(s)
    }
}
