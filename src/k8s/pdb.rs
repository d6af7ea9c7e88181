//! PDB (PodDisruptionBudget) drain deadlock validation.
//!
//! Detects PDBs that would block node drain during managed node group rolling updates.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::cloud::DisruptionBudgetApi;
use crate::error::KuoError;

/// The parts of a `PodDisruptionBudget` the preflight check looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisruptionBudget {
    pub namespace: String,
    pub name: String,
    pub disruptions_allowed: i32,
    pub expected_pods: i32,
}

impl DisruptionBudget {
    /// A budget blocks drain when it currently allows zero disruptions.
    pub const fn is_blocking(&self) -> bool {
        self.disruptions_allowed == 0
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Budgets that would stall a rolling node replacement.
pub fn blocking_budgets(budgets: &[DisruptionBudget]) -> Vec<&DisruptionBudget> {
    budgets.iter().filter(|b| b.is_blocking()).collect()
}

/// Lists PDBs cluster-wide on the target cluster.
pub struct PdbLister {
    client: kube::Client,
}

impl PdbLister {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DisruptionBudgetApi for PdbLister {
    async fn list_disruption_budgets(&self) -> Result<Vec<DisruptionBudget>> {
        let pdbs: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let list = pdbs
            .list(&ListParams::default())
            .await
            .map_err(|e| list_error(&e))?;

        debug!("Found {} PDBs in cluster", list.items.len());
        Ok(list.items.iter().filter_map(from_pdb).collect())
    }
}

fn list_error(err: &kube::Error) -> KuoError {
    let code = match err {
        kube::Error::Api(status) => Some(status.code),
        _ => None,
    };
    classify_status(code, format!("Failed to list PDBs: {err}"))
}

/// The target cluster refusing our token is an authentication failure, not an outage.
pub(crate) fn classify_status(code: Option<u16>, message: String) -> KuoError {
    match code {
        Some(401 | 403) => KuoError::AwsCredentials("k8s::pdb".to_string(), message),
        _ => KuoError::KubernetesApi(message),
    }
}

/// PDBs without a status have not been observed by the disruption controller yet
/// and are skipped.
fn from_pdb(pdb: &PodDisruptionBudget) -> Option<DisruptionBudget> {
    let status = pdb.status.as_ref()?;
    Some(DisruptionBudget {
        namespace: pdb
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        name: pdb
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        disruptions_allowed: status.disruptions_allowed,
        expected_pods: status.expected_pods,
    })
}
