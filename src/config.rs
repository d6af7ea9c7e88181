use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;

use crate::backoff::BackoffConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kuo",
    version = crate::VERSION_INFO,
    about = "Kubernetes Upgrade Operator for EKS clusters"
)]
pub struct Config {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    pub workers: usize,

    /// Health server port (/healthz, /readyz)
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Metrics server port (/metrics)
    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Slack Incoming Webhook URL; notifications are disabled when empty
    #[arg(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,

    /// First retry delay after a transient error, in seconds
    #[arg(long, env = "BACKOFF_INITIAL_SECONDS", default_value = "5")]
    pub backoff_initial_seconds: u64,

    /// Upper bound of the retry delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECONDS", default_value = "300")]
    pub backoff_max_seconds: u64,

    /// Growth factor of the retry delay
    #[arg(long, env = "BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub backoff_multiplier: f64,

    /// Upper bound of the retry delay after an authentication failure, in seconds
    #[arg(long, env = "AUTH_BACKOFF_MAX_SECONDS", default_value = "120")]
    pub auth_backoff_max_seconds: u64,

    /// Assumed-role credentials closer than this to expiry are refreshed, in seconds
    #[arg(long, env = "CREDENTIAL_REFRESH_WINDOW_SECONDS", default_value = "300")]
    pub credential_refresh_window_seconds: u64,

    /// Region for STS calls (defaults to each upgrade's region)
    #[arg(long, env = "STS_REGION")]
    pub sts_region: Option<String>,

    /// Print the EKSUpgrade CRD as YAML and exit
    #[arg(long)]
    pub print_crd: bool,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(self.backoff_initial_seconds),
            max_delay: Duration::from_secs(self.backoff_max_seconds),
            multiplier: self.backoff_multiplier,
            ..BackoffConfig::default()
        }
    }

    /// Authentication failures retry forever, so their delay gets its own cap.
    pub fn auth_backoff(&self) -> BackoffConfig {
        self.backoff()
            .with_max_delay(Duration::from_secs(self.auth_backoff_max_seconds))
    }

    pub fn refresh_window(&self) -> TimeDelta {
        i64::try_from(self.credential_refresh_window_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn slack_webhook_url(&self) -> Option<&str> {
        self.slack_webhook_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    pub fn display(&self) {
        tracing::info!(
            workers = self.workers,
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            slack = self.slack_webhook_url().is_some(),
            backoff_initial_seconds = self.backoff_initial_seconds,
            backoff_max_seconds = self.backoff_max_seconds,
            auth_backoff_max_seconds = self.auth_backoff_max_seconds,
            credential_refresh_window_seconds = self.credential_refresh_window_seconds,
            sts_region = self.sts_region.as_deref().unwrap_or("per-upgrade"),
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );
    }
}
