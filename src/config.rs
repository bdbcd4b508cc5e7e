// Configuration module - command line and environment settings
//
// This module is responsible for:
// 1. Declaring the command line flags (with environment fallbacks)
// 2. Validating them into a strongly-typed `ExporterConfig`
// 3. Providing the client, registry and scheduler settings derived from it

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::azion::client::DEFAULT_BASE_URL;
use crate::azion::{ClientSettings, Credentials, RetryPolicy};
use crate::scheduler::DEFAULT_POLL_INTERVAL;

/// Errors that can occur while validating the configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(&'static str),

    #[error("Invalid value for {setting}: {reason}")]
    InvalidSetting { setting: &'static str, reason: String },
}

/// Prometheus exporter for Azion Analytics
#[derive(Parser, Debug, Clone)]
#[command(name = "azion-exporter", version, about)]
pub struct Args {
    /// Address on which to expose metrics and web interface
    #[arg(long = "web.listen-address", env = "AZION_EXPORTER_LISTEN", default_value = ":9801")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub telemetry_path: String,

    /// API email address used to obtain the authorization token
    #[arg(long = "azion.email", env = "AZION_EMAIL")]
    pub email: Option<String>,

    /// API password used to obtain the authorization token
    #[arg(long = "azion.password", env = "AZION_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Base URL of the Azion API
    #[arg(long = "azion.base-url", env = "AZION_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Timeout in seconds for a single API request
    #[arg(long = "azion.timeout", default_value_t = 20)]
    pub timeout_secs: u64,

    /// Extra attempts for a failed API request within one poll
    #[arg(long = "azion.max-retries", default_value_t = 1)]
    pub max_retries: u32,

    /// Pause in milliseconds between attempts
    #[arg(long = "azion.retry-delay-ms", default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Analytics time window passed as `date_from`
    #[arg(long = "azion.date-from", default_value = "last-hour")]
    pub date_from: String,

    /// List of metrics separated by comma (empty enables all)
    #[arg(long = "metrics.filter", env = "AZION_METRICS", value_delimiter = ',')]
    pub metrics_filter: Vec<String>,

    /// Interval in seconds to retrieve metrics from the API
    #[arg(long = "metrics.interval", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub interval_secs: u64,
}

/// Validated exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub credentials: Credentials,
    pub listen_address: SocketAddr,
    pub telemetry_path: String,
    pub enabled_metrics: Vec<String>,
    pub poll_interval: Duration,
    pub client: ClientSettings,
}

impl TryFrom<Args> for ExporterConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let email = non_empty(args.email).ok_or(ConfigError::MissingRequiredSetting(
            "--azion.email (or AZION_EMAIL)",
        ))?;
        let password = non_empty(args.password).ok_or(ConfigError::MissingRequiredSetting(
            "--azion.password (or AZION_PASSWORD)",
        ))?;

        if args.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "--metrics.interval",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if args.timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "--azion.timeout",
                reason: "must be at least 1 second".to_string(),
            });
        }

        let listen_address = parse_listen_address(&args.listen_address)?;
        let telemetry_path = validate_telemetry_path(&args.telemetry_path)?;
        let base_url = validate_base_url(&args.base_url)?;

        let enabled_metrics = args
            .metrics_filter
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();

        Ok(ExporterConfig {
            credentials: Credentials::new(email, password),
            listen_address,
            telemetry_path,
            enabled_metrics,
            poll_interval: Duration::from_secs(args.interval_secs),
            client: ClientSettings {
                base_url,
                request_timeout: Duration::from_secs(args.timeout_secs),
                date_from: args.date_from,
                retry: RetryPolicy {
                    max_retries: args.max_retries,
                    delay: Duration::from_millis(args.retry_delay_ms),
                },
            },
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Accepts `host:port` or a bare `:port`, which binds every interface.
fn parse_listen_address(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    let candidate = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => value.to_string(),
    };

    candidate.parse().map_err(|e| ConfigError::InvalidSetting {
        setting: "--web.listen-address",
        reason: format!("'{}': {}", value, e),
    })
}

fn validate_telemetry_path(value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSetting {
        setting: "--web.telemetry-path",
        reason: reason.to_string(),
    };

    if !value.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if value == "/" {
        return Err(invalid("'/' is reserved for the landing page"));
    }
    Ok(value.to_string())
}

fn validate_base_url(value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    let url = reqwest::Url::parse(value).map_err(|e| ConfigError::InvalidSetting {
        setting: "--azion.base-url",
        reason: format!("'{}': {}", value, e),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidSetting {
            setting: "--azion.base-url",
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    let mut normalized = url.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Hides the local part of an email address for logging
///
/// # Example
/// ```text
/// operator@example.com
/// becomes
/// o****@example.com
/// ```
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{}****@{}", first, domain)
        }
        None => "****".to_string(),
    }
}
