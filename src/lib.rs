//! # Vaultkeeper
//!
//! Vaultkeeper is a secret and certificate lifecycle orchestrator for a fleet
//! of co-located services. It keeps service credentials in an encrypted store
//! protected by a threshold seal, runs a two-level certificate authority,
//! brokers credentials to services, rotates them on schedule, and releases
//! service launches in dependency order.
//!
//! ## Architecture
//!
//! ```text
//! Threshold Seal ─→ Secret Store ─→ Credential Broker ─→ services
//!        │               │                 ↑
//!        └──────→ CA Hierarchy ────────────┘
//!                        ↑
//! Rotation Scheduler ────┴──→ Startup Coordinator (restarts, gates)
//! ```
//!
//! The [`orchestrator::Orchestrator`] wires these together; [`api`] exposes
//! them over HTTP and [`cli`] drives the API from the command line.

pub mod api;
pub mod audit;
pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod errors;
pub mod observability;
pub mod orchestrator;
pub mod pki;
pub mod rotation;
pub mod seal;
pub mod secrets;
pub mod startup;
pub mod storage;

pub use config::AppConfig;
pub use errors::{Error, Result};
pub use orchestrator::Orchestrator;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
