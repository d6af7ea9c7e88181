//! Region-based AWS SDK configuration, STS identity and the live cloud connector.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sts::Client as StsClient;
use aws_sdk_sts::types::Tag;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::cloud::{CloudConnector, DisruptionBudgetApi, EksApi};
use crate::credentials::{Credentials, IdentityApi, TemporaryCredentials};
use crate::crd::AwsIdentity;
use crate::eks::{ClusterInfo, EksClient};
use crate::error::KuoError;
use crate::k8s::{self, PdbLister};

/// Build an SDK config for a region.
///
/// Ambient credentials use the default chain (IRSA, EKS Pod Identity, instance
/// profile, env vars). Assumed credentials are pinned as static credentials; the
/// broker refreshes them before they expire.
pub async fn sdk_config(region: &str, credentials: &Credentials) -> aws_config::SdkConfig {
    let loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()));

    match credentials {
        Credentials::Ambient => {
            debug!("Creating AWS config for region {} with ambient credentials", region);
            loader.load().await
        }
        Credentials::Assumed {
            role_arn,
            credentials,
        } => {
            debug!("Creating AWS config for region {} as {}", region, role_arn);
            loader
                .credentials_provider(aws_sdk_sts::config::Credentials::new(
                    credentials.access_key_id.clone(),
                    credentials.secret_access_key.expose_secret().to_string(),
                    Some(credentials.session_token.expose_secret().to_string()),
                    Some(SystemTime::from(credentials.expiration)),
                    "kuo-assume-role",
                ))
                .load()
                .await
        }
    }
}

/// STS-backed identity operations.
pub struct StsIdentity {
    /// Overrides the region used for STS calls (regional endpoint).
    sts_region: Option<String>,
}

impl StsIdentity {
    pub const fn new(sts_region: Option<String>) -> Self {
        Self { sts_region }
    }

    async fn client(&self, region: &str, credentials: &Credentials) -> StsClient {
        let region = self.sts_region.as_deref().unwrap_or(region);
        StsClient::new(&sdk_config(region, credentials).await)
    }
}

#[async_trait]
impl IdentityApi for StsIdentity {
    async fn caller_identity(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<AwsIdentity> {
        let resp = self
            .client(region, credentials)
            .await
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))
            .context("STS GetCallerIdentity failed")?;

        Ok(AwsIdentity {
            account_id: resp.account().unwrap_or("unknown").to_string(),
            arn: resp.arn().unwrap_or("unknown").to_string(),
        })
    }

    async fn assume_role(
        &self,
        region: &str,
        role_arn: &str,
        session_name: &str,
        tags: &[(String, String)],
    ) -> Result<TemporaryCredentials> {
        let tags = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid session tag")?;

        let assumed = self
            .client(region, &Credentials::Ambient)
            .await
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| KuoError::from_sdk(module_path!(), &e))?;

        let creds = assumed
            .credentials()
            .ok_or_else(|| anyhow::anyhow!("AssumeRole returned no credentials for {role_arn}"))?;

        let expiration = creds.expiration();
        let expiration = DateTime::<Utc>::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| anyhow::anyhow!("AssumeRole returned an invalid expiration"))?;

        Ok(TemporaryCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: SecretString::from(creds.secret_access_key().to_string()),
            session_token: SecretString::from(creds.session_token().to_string()),
            expiration,
        })
    }
}

/// Connector for the real AWS and target cluster APIs.
pub struct AwsConnector;

#[async_trait]
impl CloudConnector for AwsConnector {
    async fn eks(&self, region: &str, credentials: &Credentials) -> Result<Arc<dyn EksApi>> {
        let config = sdk_config(region, credentials).await;
        Ok(Arc::new(EksClient::new(&config, region)))
    }

    async fn disruption_budgets(
        &self,
        cluster: &ClusterInfo,
        credentials: &Credentials,
    ) -> Result<Arc<dyn DisruptionBudgetApi>> {
        let config = sdk_config(&cluster.region, credentials).await;
        let client = k8s::build_kube_client(cluster, &config).await?;
        Ok(Arc::new(PdbLister::new(client)))
    }
}
