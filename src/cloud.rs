//! Cloud API seams used by the upgrade phases.
//!
//! Phases talk to EKS and to the target cluster only through these traits, so
//! the reconciler can run against in-memory fakes.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::credentials::Credentials;
use crate::eks::{AddonInfo, ClusterInfo, InsightsSummary, NodeGroupInfo, UpdateInfo, UpdateScope};
use crate::k8s::DisruptionBudget;

/// EKS control plane API.
#[async_trait]
pub trait EksApi: Send + Sync {
    /// Fails with `ClusterNotFound` when the cluster does not exist.
    async fn describe_cluster(&self, cluster: &str) -> Result<ClusterInfo>;

    async fn update_cluster_version(&self, cluster: &str, version: &str) -> Result<String>;

    async fn list_addons(&self, cluster: &str) -> Result<Vec<AddonInfo>>;

    /// Versions compatible with `k8s_version`, newest first.
    async fn addon_versions(&self, addon: &str, k8s_version: &str) -> Result<Vec<String>>;

    async fn update_addon(&self, cluster: &str, addon: &str, version: &str) -> Result<String>;

    async fn list_nodegroups(&self, cluster: &str) -> Result<Vec<NodeGroupInfo>>;

    async fn update_nodegroup_version(
        &self,
        cluster: &str,
        nodegroup: &str,
        version: &str,
    ) -> Result<String>;

    async fn describe_update(
        &self,
        cluster: &str,
        scope: &UpdateScope,
        update_id: &str,
    ) -> Result<UpdateInfo>;

    async fn list_updates(&self, cluster: &str, scope: &UpdateScope) -> Result<Vec<UpdateInfo>>;

    async fn list_insights(&self, cluster: &str) -> Result<InsightsSummary>;
}

/// `PodDisruptionBudget` listing on the target cluster.
#[async_trait]
pub trait DisruptionBudgetApi: Send + Sync {
    async fn list_disruption_budgets(&self) -> Result<Vec<DisruptionBudget>>;
}

/// Builds API clients for a region and credential set.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn eks(&self, region: &str, credentials: &Credentials) -> Result<Arc<dyn EksApi>>;

    async fn disruption_budgets(
        &self,
        cluster: &ClusterInfo,
        credentials: &Credentials,
    ) -> Result<Arc<dyn DisruptionBudgetApi>>;
}

/// Clients for one reconcile of one `EKSUpgrade`.
pub struct CloudSession {
    pub eks: Arc<dyn EksApi>,
    connector: Arc<dyn CloudConnector>,
    credentials: Credentials,
    budgets: OnceCell<Arc<dyn DisruptionBudgetApi>>,
}

impl CloudSession {
    pub async fn open(
        connector: Arc<dyn CloudConnector>,
        region: &str,
        credentials: Credentials,
    ) -> Result<Self> {
        let eks = connector.eks(region, &credentials).await?;
        Ok(Self {
            eks,
            connector,
            credentials,
            budgets: OnceCell::new(),
        })
    }

    /// Target-cluster client, built on first use.
    pub async fn disruption_budgets(
        &self,
        cluster: &ClusterInfo,
    ) -> Result<Arc<dyn DisruptionBudgetApi>> {
        self.budgets
            .get_or_try_init(|| self.connector.disruption_budgets(cluster, &self.credentials))
            .await
            .cloned()
    }
}
