//! AWS EKS SDK client wrapper.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_eks::Client;
use tracing::debug;

use super::addon::{self, AddonInfo};
use super::insights::{self, InsightsSummary};
use super::nodegroup::{self, NodeGroupInfo};
use super::update::{self, UpdateInfo, UpdateScope};
use crate::cloud::EksApi;
use crate::error::KuoError;

/// Cluster information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub version: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub ca_data: Option<String>,
    pub deletion_protection: Option<bool>,
}

impl std::fmt::Display for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) - {}", self.name, self.version, self.region)
    }
}

/// EKS client wrapper for cluster operations.
#[derive(Clone)]
pub struct EksClient {
    client: Client,
    region: String,
}

impl EksClient {
    pub fn new(config: &aws_config::SdkConfig, region: &str) -> Self {
        Self {
            client: Client::new(config),
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl EksApi for EksClient {
    async fn describe_cluster(&self, cluster_name: &str) -> Result<ClusterInfo> {
        debug!("Describing cluster: {}", cluster_name);

        let response = self
            .client
            .describe_cluster()
            .name(cluster_name)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception())
                {
                    KuoError::ClusterNotFound(cluster_name.to_string())
                } else {
                    KuoError::from_sdk(module_path!(), &e)
                }
            })?;

        let cluster = response
            .cluster()
            .ok_or_else(|| KuoError::ClusterNotFound(cluster_name.to_string()))?;

        Ok(ClusterInfo {
            name: cluster.name().unwrap_or(cluster_name).to_string(),
            version: cluster.version().unwrap_or_default().to_string(),
            region: self.region.clone(),
            endpoint: cluster.endpoint().map(str::to_string),
            ca_data: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .map(str::to_string),
            deletion_protection: cluster.deletion_protection(),
        })
    }

    async fn update_cluster_version(&self, cluster_name: &str, version: &str) -> Result<String> {
        debug!(
            "Updating cluster {} control plane to version {}",
            cluster_name, version
        );

        let response = self
            .client
            .update_cluster_version()
            .name(cluster_name)
            .version(version)
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

        let update_id = response
            .update()
            .and_then(|u| u.id())
            .map(str::to_string)
            .ok_or_else(|| {
                KuoError::aws(module_path!(), "UpdateClusterVersion returned no update ID")
            })?;

        debug!("Control plane update initiated: {}", update_id);
        Ok(update_id)
    }

    async fn list_addons(&self, cluster_name: &str) -> Result<Vec<AddonInfo>> {
        addon::list_addons(&self.client, cluster_name).await
    }

    async fn addon_versions(&self, addon_name: &str, k8s_version: &str) -> Result<Vec<String>> {
        addon::compatible_versions(&self.client, addon_name, k8s_version).await
    }

    async fn update_addon(
        &self,
        cluster_name: &str,
        addon_name: &str,
        version: &str,
    ) -> Result<String> {
        addon::update_addon(&self.client, cluster_name, addon_name, version).await
    }

    async fn list_nodegroups(&self, cluster_name: &str) -> Result<Vec<NodeGroupInfo>> {
        nodegroup::list_nodegroups(&self.client, cluster_name).await
    }

    async fn update_nodegroup_version(
        &self,
        cluster_name: &str,
        nodegroup_name: &str,
        version: &str,
    ) -> Result<String> {
        nodegroup::update_nodegroup_version(&self.client, cluster_name, nodegroup_name, version)
            .await
    }

    async fn describe_update(
        &self,
        cluster_name: &str,
        scope: &UpdateScope,
        update_id: &str,
    ) -> Result<UpdateInfo> {
        update::describe_update(&self.client, cluster_name, scope, update_id).await
    }

    async fn list_updates(&self, cluster_name: &str, scope: &UpdateScope) -> Result<Vec<UpdateInfo>> {
        update::list_updates(&self.client, cluster_name, scope).await
    }

    async fn list_insights(&self, cluster_name: &str) -> Result<InsightsSummary> {
        insights::list_insights(&self.client, cluster_name).await
    }
}
