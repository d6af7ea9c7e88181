//! Kubernetes version parsing and upgrade path calculation.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::KuoError;

/// A Kubernetes `major.minor` version as used by EKS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubeVersion {
    pub major: u32,
    pub minor: u32,
}

impl FromStr for KubeVersion {
    type Err = KuoError;

    /// Accepts `1.32` and tolerates a patch suffix (`1.32.1`).
    fn from_str(version: &str) -> Result<Self, Self::Err> {
        let invalid = || KuoError::InvalidVersion(version.to_string());
        let mut parts = version.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Calculate the control plane hops from current to target version.
///
/// Each hop is exactly one minor version. Same version yields an empty path
/// (sync mode). Downgrades and cross-major upgrades are rejected.
pub fn calculate_upgrade_path(current: &str, target: &str) -> Result<Vec<String>> {
    let from: KubeVersion = current.parse()?;
    let to: KubeVersion = target.parse()?;

    if from.major != to.major {
        return Err(KuoError::UpgradeNotPossible(format!(
            "Cross-major version upgrades are not supported ({from} -> {to})"
        ))
        .into());
    }

    if to.minor < from.minor {
        return Err(KuoError::UpgradeNotPossible(format!(
            "Target version {target} is lower than current version {current} (downgrade not supported)"
        ))
        .into());
    }

    Ok(((from.minor + 1)..=to.minor)
        .map(|minor| {
            KubeVersion {
                major: from.major,
                minor,
            }
            .to_string()
        })
        .collect())
}
