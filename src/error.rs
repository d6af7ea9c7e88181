//! Custom error types for kuo.

use aws_sdk_eks::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Errors that can occur during EKS upgrade operations.
#[derive(Error, Debug)]
pub enum KuoError {
    /// The request may or may not have reached AWS (dispatch failure, timeout).
    #[error("[{0}] {1}")]
    AwsSdk(String, String),

    /// AWS throttled the request before acting on it.
    #[error("[{0}] AWS throttled request: {1}")]
    AwsThrottled(String, String),

    /// AWS answered and refused the request permanently.
    #[error("[{0}] AWS rejected request: {1}")]
    AwsRejected(String, String),

    #[error("[{0}] AWS credentials error: {1}")]
    AwsCredentials(String, String),

    #[error("[{0}] AWS region not configured: {1}")]
    AwsRegion(String, String),

    #[error("Failed to assume role {0}: {1}")]
    AssumeRole(String, String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Upgrade not possible: {0}")]
    UpgradeNotPossible(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Status of {0} was modified concurrently")]
    StatusConflict(String),
}

const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

/// Server-side failures. AWS may have applied the request before failing.
const SERVER_ERROR_CODES: &[&str] = &[
    "ServerException",
    "ServiceUnavailableException",
    "InternalFailure",
];

const CREDENTIAL_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "AccessDenied",
    "AccessDeniedException",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
];

impl KuoError {
    /// Create an AWS SDK error from any error type.
    /// Analyzes the error message to provide more specific error types.
    pub fn aws<E: std::fmt::Debug + std::fmt::Display>(component: &str, err: E) -> Self {
        // Use Debug format to get more detailed error information
        let err_debug = format!("{err:?}");
        let err_display = err.to_string();
        let component = component.to_string();

        // Combine both for analysis
        let combined = format!("{err_display} {err_debug}");
        let combined_lower = combined.to_lowercase();

        // Check for credentials-related errors
        if combined_lower.contains("no credentials")
            || combined_lower.contains("credentials not found")
            || combined_lower.contains("invalid credentials")
            || combined_lower.contains("expired token")
            || combined_lower.contains("expiredtoken")
            || combined_lower.contains("the security token included in the request is invalid")
            || combined_lower.contains("the security token included in the request is expired")
            || combined_lower.contains("unrecognized client")
            || combined_lower.contains("invalidclienttokenid")
            || combined_lower.contains("signaturedoesnotmatch")
            || combined_lower.contains("access denied")
            || combined_lower.contains("not authorized")
            || combined_lower.contains("accessdenied")
        {
            return Self::AwsCredentials(
                component,
                Self::extract_error_details(&err_debug, &err_display),
            );
        }

        // Check for region-related errors
        if combined_lower.contains("no region")
            || combined_lower.contains("region not found")
            || combined_lower.contains("missing region")
        {
            return Self::AwsRegion(
                component,
                Self::extract_error_details(&err_debug, &err_display),
            );
        }

        Self::AwsSdk(
            component,
            Self::extract_error_details(&err_debug, &err_display),
        )
    }

    /// Classify a typed SDK error.
    ///
    /// Service errors carry an error code and are definite answers from AWS.
    /// Everything else falls back to message analysis.
    pub fn from_sdk<E, R>(component: &str, err: &SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match err {
            SdkError::ServiceError(service) => {
                let inner = service.err();
                let message = inner
                    .message()
                    .map_or_else(|| inner.to_string(), str::to_string);
                Self::classify_code(component, inner.code().unwrap_or_default(), message)
            }
            SdkError::ConstructionFailure(_) => {
                Self::AwsRejected(component.to_string(), format!("{err}"))
            }
            _ => Self::aws(component, ErrorChain(err)),
        }
    }

    pub(crate) fn classify_code(component: &str, code: &str, message: String) -> Self {
        let component = component.to_string();
        if THROTTLING_CODES.contains(&code) {
            Self::AwsThrottled(component, format!("{code}: {message}"))
        } else if SERVER_ERROR_CODES.contains(&code) {
            Self::AwsSdk(component, format!("{code}: {message}"))
        } else if CREDENTIAL_CODES.contains(&code) {
            Self::AwsCredentials(component, format!("{code}: {message}"))
        } else if code.is_empty() {
            Self::AwsRejected(component, message)
        } else {
            Self::AwsRejected(component, format!("{code}: {message}"))
        }
    }

    /// Extract meaningful error details from AWS SDK error.
    /// Returns a single-line error message.
    fn extract_error_details(debug_str: &str, display_str: &str) -> String {
        // Try to extract the "message" field from AWS SDK error
        // Pattern: message: Some("actual error message")
        if let Some(pos) = debug_str.find("message: Some(\"") {
            let start = pos + "message: Some(\"".len();
            let rest = &debug_str[start..];
            if let Some(end) = rest.find('"') {
                return rest[..end].to_string();
            }
        }

        // Fallback: use display string if it's informative
        if !display_str.to_lowercase().contains("service error") {
            return display_str.to_string();
        }

        // Last resort: generic message
        "AWS API request failed".to_string()
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AwsSdk(_, _)
                | Self::AwsThrottled(_, _)
                | Self::KubernetesApi(_)
                | Self::StatusConflict(_)
        )
    }

    /// Authentication failures are retried with the auth backoff, never terminal.
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AwsCredentials(_, _) | Self::AssumeRole(_, _))
    }

    /// True when AWS definitely did not apply the request.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AwsThrottled(_, _)
                | Self::AwsRejected(_, _)
                | Self::AwsCredentials(_, _)
                | Self::AwsRegion(_, _)
        )
    }
}

/// Find a `KuoError` anywhere in an `anyhow` chain.
pub fn find(err: &anyhow::Error) -> Option<&KuoError> {
    err.chain().find_map(|cause| cause.downcast_ref::<KuoError>())
}

/// Display adapter that renders an error with its whole source chain.
struct ErrorChain<'a, E: std::error::Error>(&'a E);

impl<E: std::error::Error> std::fmt::Display for ErrorChain<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

impl<E: std::error::Error> std::fmt::Debug for ErrorChain<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.0, f)
    }
}
