//! `EKSUpgrade` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{EKSUpgrade, EKSUpgradeSpec, NotificationConfig, TimeoutConfig};
#[allow(unused_imports)]
pub use status::{
    AddonTarget, AwsIdentity, EKSUpgradeStatus, NodegroupTarget,
    PreflightCheckStatus, StepHandle, UpgradeCondition, UpgradePlan, addon_key,
    control_plane_key, nodegroup_key,
};
pub use types::{AuthState, CheckResult, CompletionKind, StepState, UpgradePhase};
