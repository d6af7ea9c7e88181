//! EKS asynchronous update tracking (`DescribeUpdate` / `ListUpdates`).

use anyhow::Result;
use aws_sdk_eks::Client;
use aws_sdk_eks::types::{Update, UpdateParamType};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::debug;

use crate::error::KuoError;

/// What an update applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateScope {
    Cluster,
    Addon(String),
    Nodegroup(String),
}

impl std::fmt::Display for UpdateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => f.write_str("cluster"),
            Self::Addon(name) => write!(f, "addon/{name}"),
            Self::Nodegroup(name) => write!(f, "nodegroup/{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl UpdateStatus {
    /// Unknown values are treated as still running.
    pub fn parse(value: &str) -> Self {
        match value {
            "Successful" => Self::Successful,
            "Failed" => Self::Failed,
            "Cancelled" => Self::Cancelled,
            _ => Self::InProgress,
        }
    }
}

/// One EKS update as reported by `DescribeUpdate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub id: String,
    pub status: UpdateStatus,
    pub update_type: String,
    /// Requested version (`Version` or `AddonVersion` parameter).
    pub version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl UpdateInfo {
    fn from_sdk(update: &Update) -> Self {
        let version = update
            .params()
            .iter()
            .find(|p| {
                matches!(
                    p.r#type(),
                    Some(UpdateParamType::Version | UpdateParamType::AddonVersion)
                )
            })
            .and_then(|p| p.value())
            .map(str::to_string);

        Self {
            id: update.id().unwrap_or_default().to_string(),
            status: UpdateStatus::parse(update.status().map_or("", |s| s.as_str())),
            update_type: update.r#type().map(|t| t.as_str().to_string()).unwrap_or_default(),
            version,
            created_at: update
                .created_at()
                .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
            errors: update
                .errors()
                .iter()
                .map(|e| {
                    let code = e.error_code().map_or("Unknown", |c| c.as_str());
                    format!("{code}: {}", e.error_message().unwrap_or_default())
                })
                .collect(),
        }
    }

    /// Short failure description for status messages.
    pub fn failure_message(&self) -> String {
        if self.errors.is_empty() {
            format!("update {} ended with status {:?}", self.id, self.status)
        } else {
            format!("update {} failed: {}", self.id, self.errors.join("; "))
        }
    }
}

/// Describe a single update.
pub async fn describe_update(
    client: &Client,
    cluster_name: &str,
    scope: &UpdateScope,
    update_id: &str,
) -> Result<UpdateInfo> {
    let mut request = client
        .describe_update()
        .name(cluster_name)
        .update_id(update_id);
    request = match scope {
        UpdateScope::Cluster => request,
        UpdateScope::Addon(name) => request.addon_name(name),
        UpdateScope::Nodegroup(name) => request.nodegroup_name(name),
    };

    let response = request
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    response.update().map(UpdateInfo::from_sdk).ok_or_else(|| {
        KuoError::AwsRejected(
            module_path!().to_string(),
            format!("DescribeUpdate returned no update for {update_id}"),
        )
        .into()
    })
}

/// List and describe all updates recorded for a scope.
pub async fn list_updates(
    client: &Client,
    cluster_name: &str,
    scope: &UpdateScope,
) -> Result<Vec<UpdateInfo>> {
    let mut ids = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let mut request = client
            .list_updates()
            .name(cluster_name)
            .set_next_token(next_token.take());
        request = match scope {
            UpdateScope::Cluster => request,
            UpdateScope::Addon(name) => request.addon_name(name),
            UpdateScope::Nodegroup(name) => request.nodegroup_name(name),
        };
        let response = request
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;
        ids.extend(response.update_ids().iter().cloned());
        match response.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    debug!("Found {} updates for {} {}", ids.len(), cluster_name, scope);

    try_join_all(
        ids.iter()
            .map(|id| describe_update(client, cluster_name, scope, id)),
    )
    .await
}

/// Find the update that requested `version` at or after `since`.
///
/// Updates without a creation time never match.
pub fn find_matching<'a>(
    updates: &'a [UpdateInfo],
    version: &str,
    since: DateTime<Utc>,
) -> Option<&'a UpdateInfo> {
    updates
        .iter()
        .filter(|u| u.version.as_deref() == Some(version))
        .filter(|u| u.created_at.is_some_and(|t| t >= since))
        .min_by_key(|u| u.created_at)
}
