//! EKS Managed Node Group operations.

use anyhow::Result;
use aws_sdk_eks::Client;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::KuoError;

/// Managed node group information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupInfo {
    pub name: String,
    pub version: Option<String>,
}

/// List all managed node groups in a cluster.
pub async fn list_nodegroups(client: &Client, cluster_name: &str) -> Result<Vec<NodeGroupInfo>> {
    debug!("Listing managed node groups for cluster: {}", cluster_name);

    let mut names = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let response = client
            .list_nodegroups()
            .cluster_name(cluster_name)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;
        names.extend(response.nodegroups().iter().cloned());
        match response.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    let nodegroups: Vec<NodeGroupInfo> = try_join_all(
        names
            .iter()
            .map(|ng_name| describe_nodegroup(client, cluster_name, ng_name)),
    )
    .await?
    .into_iter()
    .flatten()
    .collect();

    debug!("Found {} managed node groups", nodegroups.len());
    Ok(nodegroups)
}

async fn describe_nodegroup(
    client: &Client,
    cluster_name: &str,
    nodegroup_name: &str,
) -> Result<Option<NodeGroupInfo>> {
    let response = client
        .describe_nodegroup()
        .cluster_name(cluster_name)
        .nodegroup_name(nodegroup_name)
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    Ok(response.nodegroup().map(|ng| NodeGroupInfo {
        name: ng.nodegroup_name().unwrap_or(nodegroup_name).to_string(),
        version: ng.version().map(str::to_string),
    }))
}

/// Start a rolling update of a managed node group. Returns the update ID.
pub async fn update_nodegroup_version(
    client: &Client,
    cluster_name: &str,
    nodegroup_name: &str,
    target_version: &str,
) -> Result<String> {
    info!(
        "Updating managed node group {} to version {}",
        nodegroup_name, target_version
    );

    let response = client
        .update_nodegroup_version()
        .cluster_name(cluster_name)
        .nodegroup_name(nodegroup_name)
        .version(target_version)
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    let update_id = response
        .update()
        .and_then(|u| u.id())
        .map(str::to_string)
        .ok_or_else(|| {
            KuoError::aws(module_path!(), "UpdateNodegroupVersion returned no update ID")
        })?;

    info!("Managed node group update initiated: {}", update_id);
    Ok(update_id)
}
