//! # Configuration Settings
//!
//! Defines the configuration structure for the vaultkeeper orchestrator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::broker::RetryPolicy;
use crate::errors::{Error, Result};

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub seal: SealConfig,

    #[validate(nested)]
    pub pki: PkiConfig,

    #[validate(nested)]
    pub broker: BrokerConfig,

    #[validate(nested)]
    pub rotation: RotationConfig,

    #[validate(nested)]
    pub startup: StartupConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Build configuration from `VAULTKEEPER_*` environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env(),
            seal: SealConfig::from_env(),
            pki: PkiConfig::from_env(),
            broker: BrokerConfig::from_env(),
            rotation: RotationConfig::from_env(),
            startup: StartupConfig::from_env(),
            observability: ObservabilityConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Cross-field checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.seal.threshold > self.seal.shares {
            return Err(Error::validation(format!(
                "Unseal threshold {} cannot exceed share count {}",
                self.seal.threshold, self.seal.shares
            )));
        }

        if self.pki.root_validity_hours <= self.pki.intermediate_validity_hours {
            return Err(Error::validation("Root validity must be longer than intermediate validity"));
        }
        if self.pki.intermediate_validity_hours <= self.pki.default_leaf_ttl_hours {
            return Err(Error::validation(
                "Intermediate validity must be longer than the default leaf TTL",
            ));
        }

        if self.rotation.alert_before_days >= self.rotation.rotate_before_days {
            return Err(Error::validation(
                "Alert threshold must be lower than the rotation threshold",
            ));
        }
        if self.rotation.rotate_before_days >= self.rotation.password_lifetime_days {
            return Err(Error::validation(
                "Rotation threshold must be shorter than the password lifetime",
            ));
        }

        if self.broker.initial_backoff_ms > self.broker.max_backoff_ms {
            return Err(Error::validation("Broker initial backoff cannot exceed max backoff"));
        }

        if self.observability.enable_metrics && self.observability.metrics_port == self.server.port {
            return Err(Error::validation("Server and metrics ports cannot be the same"));
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1, message = "Host cannot be empty"))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Upper bound for a single request; gate waits are capped below this
    #[validate(range(min = 1, max = 600, message = "Timeout must be between 1 and 600 seconds"))]
    pub timeout_seconds: u64,

    #[validate(range(min = 1024, message = "Max body size must be at least 1KB"))]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8200, timeout_seconds: 300, max_body_size: 1024 * 1024 }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("VAULTKEEPER_HOST", defaults.host),
            port: env_or("VAULTKEEPER_PORT", defaults.port),
            timeout_seconds: env_or("VAULTKEEPER_REQUEST_TIMEOUT_SECONDS", defaults.timeout_seconds),
            max_body_size: env_or("VAULTKEEPER_MAX_BODY_SIZE", defaults.max_body_size),
        }
    }
}

/// On-disk state location
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("./data") }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self { data_dir: env_or("VAULTKEEPER_DATA_DIR", Self::default().data_dir) }
    }
}

/// Threshold seal configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SealConfig {
    /// Shares generated by `init` when the caller does not specify
    #[validate(range(min = 1, max = 255, message = "Share count must be between 1 and 255"))]
    pub shares: u8,

    #[validate(range(min = 1, max = 255, message = "Threshold must be between 1 and 255"))]
    pub threshold: u8,

    /// Unseal from the local key backup at startup
    pub auto_unseal: bool,

    /// Bounded wait used by callers polling for the unsealed state
    #[validate(range(min = 1, max = 3600, message = "Unseal wait must be between 1 and 3600 seconds"))]
    pub unseal_wait_seconds: u64,

    #[validate(range(min = 10, max = 60000, message = "Poll interval must be between 10ms and 60s"))]
    pub poll_interval_ms: u64,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self { shares: 5, threshold: 3, auto_unseal: false, unseal_wait_seconds: 30, poll_interval_ms: 500 }
    }
}

impl SealConfig {
    pub fn unseal_wait(&self) -> Duration {
        Duration::from_secs(self.unseal_wait_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shares: env_or("VAULTKEEPER_SEAL_SHARES", defaults.shares),
            threshold: env_or("VAULTKEEPER_SEAL_THRESHOLD", defaults.threshold),
            auto_unseal: env_bool("VAULTKEEPER_AUTO_UNSEAL", defaults.auto_unseal),
            unseal_wait_seconds: env_or("VAULTKEEPER_UNSEAL_WAIT_SECONDS", defaults.unseal_wait_seconds),
            poll_interval_ms: env_or("VAULTKEEPER_UNSEAL_POLL_INTERVAL_MS", defaults.poll_interval_ms),
        }
    }
}

/// CA hierarchy windows
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PkiConfig {
    #[validate(range(min = 1, max = 876_000, message = "Root validity must be between 1 hour and 100 years"))]
    pub root_validity_hours: u64,

    #[validate(range(min = 1, max = 876_000, message = "Intermediate validity must be between 1 hour and 100 years"))]
    pub intermediate_validity_hours: u64,

    /// max_ttl given to roles created from the manifest
    #[validate(range(min = 1, max = 876_000, message = "Default leaf TTL must be between 1 hour and 100 years"))]
    pub default_leaf_ttl_hours: u64,

    pub default_key_size: u16,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            root_validity_hours: 87_600,
            intermediate_validity_hours: 43_800,
            default_leaf_ttl_hours: 8_760,
            default_key_size: 256,
        }
    }
}

impl PkiConfig {
    pub fn root_validity(&self) -> Duration {
        Duration::from_secs(self.root_validity_hours * HOUR)
    }

    pub fn intermediate_validity(&self) -> Duration {
        Duration::from_secs(self.intermediate_validity_hours * HOUR)
    }

    pub fn default_leaf_ttl(&self) -> Duration {
        Duration::from_secs(self.default_leaf_ttl_hours * HOUR)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root_validity_hours: env_or("VAULTKEEPER_PKI_ROOT_VALIDITY_HOURS", defaults.root_validity_hours),
            intermediate_validity_hours: env_or(
                "VAULTKEEPER_PKI_INTERMEDIATE_VALIDITY_HOURS",
                defaults.intermediate_validity_hours,
            ),
            default_leaf_ttl_hours: env_or("VAULTKEEPER_PKI_LEAF_TTL_HOURS", defaults.default_leaf_ttl_hours),
            default_key_size: env_or("VAULTKEEPER_PKI_KEY_SIZE", defaults.default_key_size),
        }
    }
}

/// Credential broker retry discipline
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    #[validate(range(min = 1, message = "Initial backoff must be positive"))]
    pub initial_backoff_ms: u64,

    #[validate(range(min = 1, message = "Max backoff must be positive"))]
    pub max_backoff_ms: u64,

    #[validate(range(min = 1.0, max = 10.0, message = "Backoff multiplier must be between 1 and 10"))]
    pub backoff_multiplier: f64,

    #[validate(range(min = 1, message = "Deadline must be positive"))]
    pub deadline_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { initial_backoff_ms: 1_000, max_backoff_ms: 30_000, backoff_multiplier: 2.0, deadline_seconds: 120 }
    }
}

impl BrokerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            deadline: Duration::from_secs(self.deadline_seconds),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_backoff_ms: env_or("VAULTKEEPER_BROKER_INITIAL_BACKOFF_MS", defaults.initial_backoff_ms),
            max_backoff_ms: env_or("VAULTKEEPER_BROKER_MAX_BACKOFF_MS", defaults.max_backoff_ms),
            backoff_multiplier: env_or("VAULTKEEPER_BROKER_BACKOFF_MULTIPLIER", defaults.backoff_multiplier),
            deadline_seconds: env_or("VAULTKEEPER_BROKER_DEADLINE_SECONDS", defaults.deadline_seconds),
        }
    }
}

/// Rotation scheduler policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RotationConfig {
    #[validate(range(min = 1, message = "Rotation interval must be positive"))]
    pub interval_seconds: u64,

    /// Rotate when less than this much validity remains
    #[validate(range(min = 1, max = 36_500, message = "Rotate threshold must be between 1 day and 100 years"))]
    pub rotate_before_days: u64,

    /// Warn when less than this much validity remains
    #[validate(range(min = 1, max = 36_500, message = "Alert threshold must be between 1 day and 100 years"))]
    pub alert_before_days: u64,

    /// Nominal lifetime of a generated password
    #[validate(range(min = 1, max = 36_500, message = "Password lifetime must be between 1 day and 100 years"))]
    pub password_lifetime_days: u64,

    /// Window for a restarted service to report Ready after rotation
    #[validate(range(min = 1, message = "Restart timeout must be positive"))]
    pub restart_timeout_seconds: u64,

    #[validate(range(min = 1, max = 10000, message = "Alert capacity must be between 1 and 10000"))]
    pub max_alerts: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DAY,
            rotate_before_days: 60,
            alert_before_days: 30,
            password_lifetime_days: 90,
            restart_timeout_seconds: 120,
            max_alerts: 256,
        }
    }
}

impl RotationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn rotate_before(&self) -> Duration {
        Duration::from_secs(self.rotate_before_days * DAY)
    }

    pub fn alert_before(&self) -> Duration {
        Duration::from_secs(self.alert_before_days * DAY)
    }

    pub fn password_lifetime(&self) -> Duration {
        Duration::from_secs(self.password_lifetime_days * DAY)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_seconds)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval_seconds: env_or("VAULTKEEPER_ROTATION_INTERVAL_SECONDS", defaults.interval_seconds),
            rotate_before_days: env_or("VAULTKEEPER_ROTATE_BEFORE_DAYS", defaults.rotate_before_days),
            alert_before_days: env_or("VAULTKEEPER_ALERT_BEFORE_DAYS", defaults.alert_before_days),
            password_lifetime_days: env_or(
                "VAULTKEEPER_PASSWORD_LIFETIME_DAYS",
                defaults.password_lifetime_days,
            ),
            restart_timeout_seconds: env_or(
                "VAULTKEEPER_RESTART_TIMEOUT_SECONDS",
                defaults.restart_timeout_seconds,
            ),
            max_alerts: env_or("VAULTKEEPER_MAX_ALERTS", defaults.max_alerts),
        }
    }
}

/// Startup coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StartupConfig {
    /// YAML service manifest; absent means no managed services
    pub manifest_path: Option<PathBuf>,

    #[validate(range(min = 1, message = "Probe timeout must be positive"))]
    pub probe_timeout_seconds: u64,

    #[validate(range(min = 10, message = "Probe interval must be at least 10ms"))]
    pub probe_interval_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { manifest_path: None, probe_timeout_seconds: 120, probe_interval_ms: 2_000 }
    }
}

impl StartupConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            manifest_path: std::env::var("VAULTKEEPER_MANIFEST").ok().map(PathBuf::from),
            probe_timeout_seconds: env_or("VAULTKEEPER_PROBE_TIMEOUT_SECONDS", defaults.probe_timeout_seconds),
            probe_interval_ms: env_or("VAULTKEEPER_PROBE_INTERVAL_MS", defaults.probe_interval_ms),
        }
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_port: 9201,
            service_name: "vaultkeeper".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Metrics listener address, `None` when the port is 0
    pub fn metrics_bind_address(&self) -> Option<String> {
        (self.metrics_port != 0).then(|| format!("127.0.0.1:{}", self.metrics_port))
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_metrics: env_bool("VAULTKEEPER_ENABLE_METRICS", defaults.enable_metrics),
            metrics_port: env_or("VAULTKEEPER_METRICS_PORT", defaults.metrics_port),
            service_name: env_or("VAULTKEEPER_SERVICE_NAME", defaults.service_name),
            log_level: env_or("VAULTKEEPER_LOG_LEVEL", defaults.log_level),
            json_logging: env_bool("VAULTKEEPER_LOG_JSON", defaults.json_logging),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|s| s.eq_ignore_ascii_case("true") || s == "1").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_address(), "127.0.0.1:8200");
        assert_eq!(config.seal.unseal_wait(), Duration::from_secs(30));
        assert_eq!(config.rotation.rotate_before(), Duration::from_secs(60 * DAY));
        assert_eq!(config.broker.retry_policy(), RetryPolicy::default());
        assert!(!config.seal.auto_unseal);
    }

    #[test]
    fn test_threshold_above_shares_rejected() {
        let mut config = AppConfig::default();
        config.seal.threshold = 6;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_validity_windows_must_nest() {
        let mut config = AppConfig::default();
        config.pki.intermediate_validity_hours = config.pki.root_validity_hours;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pki.default_leaf_ttl_hours = config.pki.intermediate_validity_hours;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_alert_must_precede_rotation() {
        let mut config = AppConfig::default();
        config.rotation.alert_before_days = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validator_ranges() {
        let mut config = AppConfig::default();
        config.seal.shares = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.observability.log_level = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.password_lifetime_days = 100_000_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pki.root_validity_hours = 3_000_000_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_bind_address() {
        let mut config = ObservabilityConfig::default();
        assert_eq!(config.metrics_bind_address().as_deref(), Some("127.0.0.1:9201"));
        config.metrics_port = 0;
        assert!(config.metrics_bind_address().is_none());
    }
}
