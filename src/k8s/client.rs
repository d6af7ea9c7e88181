//! Kubernetes client builder for EKS clusters.
//!
//! Authenticates with a presigned STS `GetCallerIdentity` URL, the same token
//! `aws eks get-token` produces, signed with the broker's credentials.

use anyhow::{Context, Result};
use aws_sdk_sts::config::ProvideCredentials;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::eks::ClusterInfo;
use crate::error::KuoError;

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const SIGNED_HEADERS: &str = "host;x-k8s-aws-id";
const SHA256_BLOCK: usize = 64;

/// Build a Kubernetes client for the given EKS cluster.
///
/// Uses the cluster's API endpoint and CA certificate from `describe_cluster`
/// and the credentials carried by `config`.
pub async fn build_kube_client(
    cluster_info: &ClusterInfo,
    config: &aws_config::SdkConfig,
) -> Result<kube::Client> {
    let endpoint = cluster_info
        .endpoint
        .as_deref()
        .ok_or_else(|| KuoError::KubernetesApi("Cluster endpoint not available".to_string()))?;

    let ca_data_b64 = cluster_info
        .ca_data
        .as_deref()
        .ok_or_else(|| KuoError::KubernetesApi("Cluster CA data not available".to_string()))?;

    // AWS returns the PEM bundle base64 encoded
    let ca_pem = STANDARD
        .decode(ca_data_b64.trim())
        .context("Failed to decode cluster CA certificate from base64")?;

    let ca_certs = pem_to_der_certs(&ca_pem)?;
    if ca_certs.is_empty() {
        return Err(KuoError::KubernetesApi(
            "No certificates found in cluster CA data".to_string(),
        )
        .into());
    }

    let credentials = config
        .credentials_provider()
        .ok_or_else(|| KuoError::KubernetesApi("No credentials provider available".to_string()))?
        .provide_credentials()
        .await
        .map_err(|e| KuoError::aws("k8s::client", e))?;

    let token = build_presigned_token(
        &SigningCredentials {
            access_key: credentials.access_key_id(),
            secret_key: credentials.secret_access_key(),
            session_token: credentials.session_token(),
        },
        &cluster_info.region,
        &cluster_info.name,
        Utc::now(),
    );
    debug!(
        "Obtained EKS bearer token for cluster {}",
        cluster_info.name
    );

    let mut kube_config = kube::Config::new(
        endpoint
            .parse()
            .context("Failed to parse cluster endpoint URL")?,
    );
    kube_config.default_namespace = "default".to_string();
    kube_config.root_cert = Some(ca_certs);
    kube_config.auth_info = kube::config::AuthInfo {
        token: Some(secrecy::SecretString::from(token)),
        ..Default::default()
    };

    kube::Client::try_from(kube_config).context("Failed to build Kubernetes client from EKS config")
}

struct SigningCredentials<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    session_token: Option<&'a str>,
}

/// Presign STS `GetCallerIdentity` (SigV4, query auth) and encode it as an EKS token.
///
/// Token format: `k8s-aws-v1.` + base64url(presigned URL), no padding.
fn build_presigned_token(
    creds: &SigningCredentials<'_>,
    region: &str,
    cluster_name: &str,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let host = format!("sts.{region}.amazonaws.com");
    let credential_scope = format!("{date_stamp}/{region}/sts/aws4_request");

    let mut params = vec![
        ("Action", "GetCallerIdentity".to_string()),
        ("Version", "2011-06-15".to_string()),
        ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{credential_scope}", creds.access_key),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", "60".to_string()),
        ("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string()),
    ];
    if let Some(token) = creds.session_token {
        params.push(("X-Amz-Security-Token", token.to_string()));
    }
    params.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_querystring = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n/\n{canonical_querystring}\nhost:{host}\nx-k8s-aws-id:{cluster_name}\n\n{SIGNED_HEADERS}\nUNSIGNED-PAYLOAD"
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", creds.secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"sts");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let presigned_url =
        format!("https://{host}/?{canonical_querystring}&X-Amz-Signature={signature}");

    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(presigned_url))
}

/// HMAC-SHA256 (RFC 2104).
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; SHA256_BLOCK];
    if key.len() > SHA256_BLOCK {
        key_block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(key_block.map(|b| b ^ 0x36));
    inner.update(data);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key_block.map(|b| b ^ 0x5c));
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Parse PEM data and extract DER-encoded certificate bytes.
fn pem_to_der_certs(pem_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let text = std::str::from_utf8(pem_data).context("CA data is not valid UTF-8")?;
    let mut certs = Vec::new();

    let mut in_cert = false;
    let mut b64_buf = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == "-----BEGIN CERTIFICATE-----" {
            in_cert = true;
            b64_buf.clear();
        } else if trimmed == "-----END CERTIFICATE-----" {
            if in_cert {
                let der = STANDARD
                    .decode(&b64_buf)
                    .context("Failed to decode certificate base64 content")?;
                certs.push(der);
            }
            in_cert = false;
        } else if in_cert {
            b64_buf.push_str(trimmed);
        }
    }

    Ok(certs)
}
