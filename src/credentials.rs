//! Cross-account credential broker.
//!
//! Assumed-role credentials are cached per role ARN and refreshed once they are
//! within the refresh window of their expiry. Refreshes for the same role are
//! serialized so concurrent reconciles trigger at most one `AssumeRole` call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::SecretString;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::crd::AwsIdentity;
use crate::error::KuoError;

const SESSION_NAME_MAX: usize = 64;

/// Temporary credentials returned by STS `AssumeRole`.
#[derive(Debug)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: SecretString,
    pub expiration: DateTime<Utc>,
}

/// Credentials used for one reconcile's AWS calls.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// The operator's own credential chain (IRSA, EKS Pod Identity, env).
    Ambient,
    Assumed {
        role_arn: String,
        credentials: Arc<TemporaryCredentials>,
    },
}

impl Credentials {
    pub fn role_arn(&self) -> Option<&str> {
        match self {
            Self::Ambient => None,
            Self::Assumed { role_arn, .. } => Some(role_arn),
        }
    }
}

/// STS operations used by the broker.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn caller_identity(&self, region: &str, credentials: &Credentials)
    -> Result<AwsIdentity>;

    async fn assume_role(
        &self,
        region: &str,
        role_arn: &str,
        session_name: &str,
        tags: &[(String, String)],
    ) -> Result<TemporaryCredentials>;
}

type RoleSlot = Arc<tokio::sync::Mutex<Option<Arc<TemporaryCredentials>>>>;

pub struct CredentialBroker {
    identity: Arc<dyn IdentityApi>,
    refresh_window: TimeDelta,
    operator: OnceCell<AwsIdentity>,
    roles: Mutex<HashMap<String, RoleSlot>>,
}

impl CredentialBroker {
    pub fn new(identity: Arc<dyn IdentityApi>, refresh_window: TimeDelta) -> Self {
        Self {
            identity,
            refresh_window,
            operator: OnceCell::new(),
            roles: Mutex::new(HashMap::new()),
        }
    }

    /// Credentials for `role_arn`, or the ambient chain when no role is given.
    pub async fn credentials(&self, region: &str, role_arn: Option<&str>) -> Result<Credentials> {
        let Some(role_arn) = role_arn else {
            return Ok(Credentials::Ambient);
        };

        let slot = self.slot(role_arn);
        let mut cached = slot.lock().await;

        if let Some(creds) = cached.as_ref()
            && creds.expiration - Utc::now() > self.refresh_window
        {
            debug!("Reusing cached credentials for {}", role_arn);
            return Ok(Credentials::Assumed {
                role_arn: role_arn.to_string(),
                credentials: Arc::clone(creds),
            });
        }

        let fresh = self
            .assume(region, role_arn)
            .await
            .map_err(|e| KuoError::AssumeRole(role_arn.to_string(), format!("{e:#}")))?;
        info!(
            "Assumed role {} (expires {})",
            role_arn,
            fresh.expiration.to_rfc3339()
        );

        let fresh = Arc::new(fresh);
        *cached = Some(Arc::clone(&fresh));
        Ok(Credentials::Assumed {
            role_arn: role_arn.to_string(),
            credentials: fresh,
        })
    }

    /// Drop cached credentials so the next request assumes the role again.
    pub fn invalidate(&self, role_arn: &str) {
        let slot = self
            .roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(role_arn)
            .cloned();
        if let Some(slot) = slot {
            match slot.try_lock() {
                Ok(mut cached) => *cached = None,
                // A refresh is already running and will replace the entry.
                Err(_) => warn!("Credential refresh in flight for {}", role_arn),
            }
        }
    }

    pub async fn caller_identity(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<AwsIdentity> {
        self.identity.caller_identity(region, credentials).await
    }

    fn slot(&self, role_arn: &str) -> RoleSlot {
        let mut roles = self.roles.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(roles.entry(role_arn.to_string()).or_default())
    }

    async fn assume(&self, region: &str, role_arn: &str) -> Result<TemporaryCredentials> {
        let operator = self
            .operator
            .get_or_try_init(|| async {
                self.identity
                    .caller_identity(region, &Credentials::Ambient)
                    .await
            })
            .await?;

        let tags = [
            ("Operator".to_string(), "kuo".to_string()),
            ("OperatorAccount".to_string(), operator.account_id.clone()),
        ];
        self.identity
            .assume_role(region, role_arn, &session_name(&operator.arn), &tags)
            .await
    }
}

/// Role session name derived from the operator's ARN.
///
/// `arn:aws:sts::111122223333:assumed-role/kuo-operator/1700000000` becomes
/// `kuo-kuo-operator`. STS allows `[\w+=,.@-]` and at most 64 characters.
fn session_name(operator_arn: &str) -> String {
    let resource = operator_arn.rsplit(':').next().unwrap_or(operator_arn);
    let principal = resource.split('/').nth(1).unwrap_or(resource);
    let sanitized: String = principal
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "+=,.@-_".contains(*c))
        .collect();
    let mut name = format!("kuo-{sanitized}");
    name.truncate(SESSION_NAME_MAX);
    name
}
