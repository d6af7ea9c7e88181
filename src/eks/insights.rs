//! EKS Cluster Insights operations.

use anyhow::Result;
use aws_sdk_eks::Client;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::KuoError;

/// Insight finding information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightFinding {
    pub id: String,
    pub name: String,
    pub category: String,
    pub status: String,
    pub description: String,
    pub recommendation: Option<String>,
    pub resources: Vec<InsightResource>,
}

/// Resource affected by an insight finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightResource {
    /// Resource type (e.g., "deployment", "pod", "addon")
    pub resource_type: String,
    /// Resource identifier (e.g., "kube-system/coredns", "vpc-cni")
    pub resource_id: String,
}

/// Cluster insights summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsightsSummary {
    pub total: usize,
    pub warning_count: usize,
    pub passing_count: usize,
    /// Insights in `ERROR` (or `CRITICAL`) state, described in full.
    pub critical: Vec<InsightFinding>,
}

impl InsightsSummary {
    /// Check if there are any critical blockers.
    pub fn has_critical_blockers(&self) -> bool {
        !self.critical.is_empty()
    }
}

fn is_critical(status: &str) -> bool {
    matches!(status, "ERROR" | "CRITICAL")
}

/// List insights for a cluster. Critical findings are described in detail.
pub async fn list_insights(client: &Client, cluster_name: &str) -> Result<InsightsSummary> {
    info!("Fetching cluster insights for: {}", cluster_name);

    let mut summary = InsightsSummary::default();
    let mut critical_ids = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let response = client
            .list_insights()
            .cluster_name(cluster_name)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

        for insight in response.insights() {
            summary.total += 1;
            let status = insight
                .insight_status()
                .and_then(|s| s.status())
                .map_or("UNKNOWN", |s| s.as_str());
            match status {
                s if is_critical(s) => {
                    if let Some(id) = insight.id() {
                        critical_ids.push(id.to_string());
                    }
                }
                "WARNING" => summary.warning_count += 1,
                "PASSING" => summary.passing_count += 1,
                _ => {}
            }
        }

        match response.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    summary.critical = try_join_all(
        critical_ids
            .iter()
            .map(|id| describe_insight(client, cluster_name, id)),
    )
    .await?
    .into_iter()
    .flatten()
    .collect();

    debug!(
        "Found {} insights ({} critical, {} warnings)",
        summary.total,
        summary.critical.len(),
        summary.warning_count
    );

    Ok(summary)
}

async fn describe_insight(
    client: &Client,
    cluster_name: &str,
    insight_id: &str,
) -> Result<Option<InsightFinding>> {
    debug!("Describing insight: {}", insight_id);

    let response = client
        .describe_insight()
        .cluster_name(cluster_name)
        .id(insight_id)
        .send()
        .await
        .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

    Ok(response.insight().map(|insight| InsightFinding {
        id: insight_id.to_string(),
        name: insight.name().unwrap_or(insight_id).to_string(),
        category: insight
            .category()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default(),
        status: insight
            .insight_status()
            .and_then(|s| s.status())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        description: insight.description().unwrap_or_default().to_string(),
        recommendation: insight.recommendation().map(str::to_string),
        resources: insight
            .resources()
            .iter()
            .filter_map(|r| parse_resource(r.arn(), r.kubernetes_resource_uri()))
            .collect(),
    }))
}

/// Resolve an affected resource from its ARN or Kubernetes resource URI.
fn parse_resource(arn: Option<&str>, uri: Option<&str>) -> Option<InsightResource> {
    if let Some(arn) = arn {
        // arn:aws:eks:region:account:addon/cluster-name/addon-name/id
        let parts: Vec<&str> = arn.split('/').collect();
        if parts.len() >= 3 {
            return Some(InsightResource {
                resource_type: "addon".to_string(),
                resource_id: parts[2].to_string(),
            });
        }
        return Some(InsightResource {
            resource_type: "resource".to_string(),
            resource_id: arn.to_string(),
        });
    }

    let uri = uri.filter(|u| !u.is_empty())?;
    let parts: Vec<&str> = uri.split('/').collect();
    let (resource_type, resource_id) = if parts.len() >= 4 {
        (parts[2].to_string(), format!("{}/{}", parts[1], parts[3]))
    } else if parts.len() >= 2 {
        (parts[0].to_string(), parts[1].to_string())
    } else {
        ("resource".to_string(), uri.to_string())
    };
    Some(InsightResource {
        resource_type,
        resource_id,
    })
}
