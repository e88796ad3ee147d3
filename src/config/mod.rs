//! # Configuration Management
//!
//! Environment-driven configuration for the orchestrator. Every section reads
//! `VAULTKEEPER_*` variables over its defaults; binaries load `.env` first with
//! `dotenvy`. [`AppConfig::from_env`] validates the result, including the
//! cross-field invariants (threshold within share count, nested CA windows,
//! alert threshold below the rotation threshold).

pub mod settings;

pub use settings::{
    AppConfig, BrokerConfig, ObservabilityConfig, PkiConfig, RotationConfig, SealConfig, ServerConfig,
    StartupConfig, StorageConfig,
};
