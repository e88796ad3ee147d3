//! Shared helpers for the integration tests: temporary state directories,
//! fast timing configuration and a small service manifest.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use vaultkeeper::config::AppConfig;
use vaultkeeper::orchestrator::{InitOutput, Orchestrator};
use vaultkeeper::seal::SealState;
use vaultkeeper::startup::ServiceManifest;

/// postgres ← pgbouncer, plus a TLS-less redis.
pub const MANIFEST: &str = r#"
services:
  - id: postgres
    username: app
    extra_fields:
      database: app
  - id: pgbouncer
    depends_on: [postgres]
  - id: redis
    tls: false
"#;

pub fn manifest() -> ServiceManifest {
    ServiceManifest::from_yaml(MANIFEST).expect("test manifest parses")
}

/// Config rooted in `dir` with short probe and restart windows.
pub fn fast_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.startup.probe_timeout_seconds = 2;
    config.startup.probe_interval_ms = 20;
    config.rotation.restart_timeout_seconds = 1;
    config.broker.initial_backoff_ms = 10;
    config.broker.max_backoff_ms = 50;
    config.broker.deadline_seconds = 5;
    config
}

pub async fn orchestrator(dir: &TempDir) -> Arc<Orchestrator> {
    Orchestrator::new(fast_config(dir), manifest()).await.expect("orchestrator opens")
}

/// Initialize 3-of-2 and present two shares.
pub async fn init_and_unseal(orchestrator: &Orchestrator) -> InitOutput {
    let init = orchestrator.initialize(3, 2).await.expect("initialize");
    for share in &init.shares[..2] {
        orchestrator.unseal(share.expose_secret()).await;
    }
    assert_eq!(orchestrator.seal_manager().state(), SealState::Unsealed);
    init
}
