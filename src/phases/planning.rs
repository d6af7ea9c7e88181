//! Planning phase: creates the upgrade plan and populates status.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::cloud::EksApi;
use crate::crd::{
    AddonTarget, EKSUpgradeSpec, EKSUpgradeStatus, NodegroupTarget, UpgradePhase, UpgradePlan,
};
use crate::eks::AddonInfo;
use crate::eks::version::calculate_upgrade_path;
use crate::status;

/// Build the upgrade plan for a cluster currently at `current_version`.
///
/// Add-on targets are resolved against `target_version`: an override wins,
/// otherwise the newest compatible version. Add-ons already at their target,
/// or with nothing compatible, are left out.
pub async fn plan(
    eks: &dyn EksApi,
    cluster_name: &str,
    current_version: &str,
    target_version: &str,
    overrides: &HashMap<String, String>,
) -> Result<UpgradePlan> {
    let hops = calculate_upgrade_path(current_version, target_version)?;

    let addons = eks.list_addons(cluster_name).await?;
    let resolved = try_join_all(
        addons
            .iter()
            .map(|addon| resolve_addon(eks, addon, target_version, overrides)),
    )
    .await?;

    let nodegroups = eks
        .list_nodegroups(cluster_name)
        .await?
        .into_iter()
        .map(|ng| NodegroupTarget {
            name: ng.name,
            current_version: ng.version,
        })
        .collect();

    Ok(UpgradePlan {
        current_version: current_version.to_string(),
        target_version: target_version.to_string(),
        hops,
        addons: resolved.into_iter().flatten().collect(),
        nodegroups,
    })
}

async fn resolve_addon(
    eks: &dyn EksApi,
    addon: &AddonInfo,
    k8s_version: &str,
    overrides: &HashMap<String, String>,
) -> Result<Option<AddonTarget>> {
    let target = match overrides.get(&addon.name) {
        Some(version) => Some(version.clone()),
        None => eks
            .addon_versions(&addon.name, k8s_version)
            .await?
            .into_iter()
            .next(),
    };

    let Some(target) = target else {
        debug!("No compatible version of {} for {}", addon.name, k8s_version);
        return Ok(None);
    };
    if target == addon.current_version {
        debug!("{} already at {}", addon.name, target);
        return Ok(None);
    }

    Ok(Some(AddonTarget {
        name: addon.name.clone(),
        current_version: addon.current_version.clone(),
        target_version: target,
    }))
}

/// Execute the planning phase.
///
/// A plan stored by an earlier reconcile of this generation is reused as is.
pub async fn execute(
    spec: &EKSUpgradeSpec,
    current_status: &EKSUpgradeStatus,
    eks: &dyn EksApi,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    let mut new_status = current_status.clone();

    if current_status.plan.is_none() {
        info!(
            "Planning upgrade for {} to {}",
            spec.cluster_name, spec.target_version
        );

        let cluster = eks.describe_cluster(&spec.cluster_name).await?;
        let overrides = spec.addon_versions.clone().unwrap_or_default();
        let plan = plan(
            eks,
            &spec.cluster_name,
            &cluster.version,
            &spec.target_version,
            &overrides,
        )
        .await?;

        info!(
            "Plan created: {} CP steps, {} addons, {} nodegroups{}",
            plan.hops.len(),
            plan.addons.len(),
            plan.nodegroups.len(),
            if plan.is_sync() { " (sync)" } else { "" }
        );

        new_status.current_version = Some(cluster.version);
        new_status.plan = Some(plan);
    }

    status::set_phase(&mut new_status, UpgradePhase::PreflightChecking);
    status::set_condition(&mut new_status, "Ready", "False", "UpgradeInProgress", None);
    Ok((new_status, Some(Duration::ZERO)))
}
