//! EKS Add-on operations.

use std::cmp::Ordering;

use anyhow::Result;
use aws_sdk_eks::Client;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::KuoError;

/// Installed add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub name: String,
    pub current_version: String,
}

/// Parse an EKS addon version string into a comparable tuple.
///
/// Format: `v<major>.<minor>.<patch>-eksbuild.<build>`
/// Returns `(major, minor, patch, build)` or `None` if parsing fails.
fn parse_addon_version(version: &str) -> Option<(u64, u64, u64, u64)> {
    let s = version.strip_prefix('v').unwrap_or(version);

    let (semver_part, build) = match s.split_once("-eksbuild.") {
        Some((sem, eksbuild)) => (sem, eksbuild.parse::<u64>().ok()?),
        None => (s, 0),
    };

    let mut parts = semver_part.split('.').map(str::parse::<u64>);
    let (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    Some((major, minor, patch, build))
}

/// Compare two EKS addon version strings numerically.
///
/// Falls back to lexicographic comparison if either version cannot be parsed.
pub fn compare_addon_versions(a: &str, b: &str) -> Ordering {
    match (parse_addon_version(a), parse_addon_version(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Sort versions newest first.
pub fn sort_newest_first(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_addon_versions(b, a));
}

/// List all add-ons installed on a cluster.
pub async fn list_addons(client: &Client, cluster_name: &str) -> Result<Vec<AddonInfo>> {
    debug!("Listing add-ons for cluster: {}", cluster_name);

    let mut names = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let response = client
            .list_addons()
            .cluster_name(cluster_name)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;
        names.extend(response.addons().iter().cloned());
        match response.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    // Parallel describe_addon calls; a failed describe fails the listing so the
    // plan never silently drops an installed add-on.
    let addons: Vec<AddonInfo> = try_join_all(
        names
            .iter()
            .map(|addon_name| describe_addon(client, cluster_name, addon_name)),
    )
    .await?
    .into_iter()
    .flatten()
    .collect();

    debug!("Found {} add-ons", addons.len());
    Ok(addons)
}

async fn describe_addon(
    client: &Client,
    cluster_name: &str,
    addon_name: &str,
) -> Result<Option<AddonInfo>> {
    let response = client
        .describe_addon()
        .cluster_name(cluster_name)
        .addon_name(addon_name)
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    Ok(response.addon().map(|addon| AddonInfo {
        name: addon.addon_name().unwrap_or(addon_name).to_string(),
        current_version: addon.addon_version().unwrap_or_default().to_string(),
    }))
}

/// Versions of an add-on compatible with a Kubernetes version, newest first.
pub async fn compatible_versions(
    client: &Client,
    addon_name: &str,
    k8s_version: &str,
) -> Result<Vec<String>> {
    debug!(
        "Getting compatible versions for {} with K8s {}",
        addon_name, k8s_version
    );

    let mut versions = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let response = client
            .describe_addon_versions()
            .addon_name(addon_name)
            .kubernetes_version(k8s_version)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

        versions.extend(
            response
                .addons()
                .iter()
                .flat_map(|addon| addon.addon_versions())
                .filter_map(|v| v.addon_version())
                .map(str::to_string),
        );

        match response.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    sort_newest_first(&mut versions);
    versions.dedup();
    Ok(versions)
}

/// Update an add-on to a specific version. Returns the update ID.
pub async fn update_addon(
    client: &Client,
    cluster_name: &str,
    addon_name: &str,
    target_version: &str,
) -> Result<String> {
    info!(
        "Updating add-on {} to version {}",
        addon_name, target_version
    );

    let response = client
        .update_addon()
        .cluster_name(cluster_name)
        .addon_name(addon_name)
        .addon_version(target_version)
        .resolve_conflicts(aws_sdk_eks::types::ResolveConflicts::Overwrite)
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    let update_id = response
        .update()
        .and_then(|u| u.id())
        .map(str::to_string)
        .ok_or_else(|| KuoError::aws(module_path!(), "UpdateAddon returned no update ID"))?;

    info!("Add-on update initiated: {}", update_id);
    Ok(update_id)
}
