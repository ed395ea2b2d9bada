//! Operator configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_IDENTITY_SERVICE_URL: &str = "http://auth:3000";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Operator configuration
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Base URL of the identity service; also injected into API servers as AUTH_URL
    pub identity_service_url: String,
    /// Per-request timeout for identity-service calls
    pub identity_timeout: Duration,
    /// Interval of the periodic drift-correcting resync
    pub resync_interval: Duration,
    /// Deadline for a single reconciliation
    pub reconcile_timeout: Duration,
    /// Upper bound on tenants reconciled concurrently
    pub max_concurrent_reconciles: u16,
    /// Bind address of the health and metrics server
    pub health_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            identity_service_url: DEFAULT_IDENTITY_SERVICE_URL.to_string(),
            identity_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(60),
            max_concurrent_reconciles: 4,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::Text,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let identity_service_url = lookup("IDENTITY_SERVICE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.identity_service_url);

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected text or json".to_string(),
                });
            }
        };

        Ok(Self {
            identity_service_url,
            identity_timeout: secs(&lookup, "IDENTITY_TIMEOUT_SECS", defaults.identity_timeout)?,
            resync_interval: secs(&lookup, "RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            reconcile_timeout: secs(&lookup, "RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout)?,
            max_concurrent_reconciles: parsed(
                &lookup,
                "MAX_CONCURRENT_RECONCILES",
                defaults.max_concurrent_reconciles,
            )?,
            health_addr: parsed(&lookup, "HEALTH_ADDR", defaults.health_addr)?,
            log_format,
        })
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) if value.is_empty() => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn secs<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parsed(lookup, var, default.as_secs())?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}
