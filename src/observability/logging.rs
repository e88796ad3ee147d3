//! # Structured Logging
//!
//! Subscriber setup and span macros for the orchestrator's long-running
//! operations. Secret material never appears in span fields; callers pass
//! identifiers only.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Create a tracing span for seal manager operations
#[macro_export]
macro_rules! seal_span {
    ($operation:expr) => {
        tracing::info_span!(
            "seal_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info_span!(
            "seal_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for certificate authority operations
#[macro_export]
macro_rules! pki_span {
    ($operation:expr, $service_id:expr) => {
        tracing::info_span!(
            "pki_operation",
            operation = %$operation,
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $service_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "pki_operation",
            operation = %$operation,
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one rotation cycle of a tracked item
#[macro_export]
macro_rules! rotation_span {
    ($service_id:expr) => {
        tracing::info_span!(
            "rotation_cycle",
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($service_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "rotation_cycle",
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for a startup node launch
#[macro_export]
macro_rules! node_span {
    ($service_id:expr) => {
        tracing::info_span!(
            "startup_node",
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($service_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "startup_node",
            service_id = %$service_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("vaultkeeper={0},tower_http={0}", config.log_level)))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true).with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        server_address = %config.server.bind_address(),
        data_dir = %config.storage.data_dir.display(),
        auto_unseal = config.seal.auto_unseal,
        shares = config.seal.shares,
        threshold = config.seal.threshold,
        rotation_interval_secs = config.rotation.interval_seconds,
        metrics_enabled = config.observability.enable_metrics,
        "vaultkeeper orchestrator configuration"
    );
    if config.seal.auto_unseal {
        tracing::warn!(
            key_file = %config.storage.data_dir.join(crate::storage::KEYS_FILE).display(),
            "auto-unseal is enabled: unseal shares are read from local disk at startup"
        );
    }
}
