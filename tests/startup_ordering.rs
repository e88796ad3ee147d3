//! Manifest-driven startup with real TCP probes.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vaultkeeper::startup::{NodeState, ServiceManifest, ServiceStatus, ORCHESTRATOR_NODE};
use vaultkeeper::{Error, Orchestrator};

/// An address nothing listens on.
async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

fn manifest(open: &str, closed: &str) -> ServiceManifest {
    ServiceManifest::from_yaml(&format!(
        r#"
services:
  - id: postgres
    probe: {{ kind: tcp, address: "{open}" }}
  - id: pgbouncer
    depends_on: [postgres]
    probe: {{ kind: tcp, address: "{closed}" }}
  - id: api
    depends_on: [pgbouncer]
  - id: redis
    tls: false
"#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_failed_probe_blocks_only_downstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().to_string();
    let closed = closed_address().await;

    let dir = TempDir::new().unwrap();
    let mut config = common::fast_config(&dir);
    config.startup.probe_timeout_seconds = 1;
    let orchestrator = Orchestrator::new(config, manifest(&open, &closed)).await.unwrap();
    common::init_and_unseal(&orchestrator).await;

    let coordinator = orchestrator.coordinator();
    assert_eq!(coordinator.graph().order().first().map(String::as_str), Some(ORCHESTRATOR_NODE));

    let report = coordinator.run(CancellationToken::new()).await;
    assert!(!report.is_complete());
    assert!(report.ready.contains(&"postgres".to_string()));
    assert!(report.ready.contains(&"redis".to_string()));
    assert!(report.failed.contains_key("pgbouncer"));
    assert_eq!(report.blocked.get("api"), Some(&vec!["pgbouncer".to_string()]));

    let errors = report.dependency_errors();
    assert!(matches!(&errors[..], [Error::DependencyFailed { service_id, .. }] if service_id == "api"));

    assert_eq!(coordinator.status("pgbouncer"), Some(ServiceStatus::Failed));
    assert_eq!(coordinator.status("api"), Some(ServiceStatus::WaitingOnDependency));
    assert!(!coordinator.wait_until_ready("api", Duration::from_millis(100)).await.unwrap());
    assert!(coordinator.wait_until_ready("postgres", Duration::from_millis(100)).await.unwrap());
    assert!(matches!(coordinator.wait_until_ready("ghost", Duration::from_millis(10)).await, Err(Error::NotFound { .. })));
    drop(listener);
}

#[tokio::test]
async fn test_sealed_orchestrator_holds_every_service() {
    let dir = TempDir::new().unwrap();
    let mut config = common::fast_config(&dir);
    config.startup.probe_timeout_seconds = 1;
    let orchestrator = Orchestrator::new(config, common::manifest()).await.unwrap();
    orchestrator.initialize(3, 2).await.unwrap();

    let report = orchestrator.coordinator().run(CancellationToken::new()).await;
    assert!(report.ready.is_empty());
    assert!(report.failed.contains_key(ORCHESTRATOR_NODE));
    assert_eq!(report.blocked.len(), 3);
    assert_eq!(orchestrator.coordinator().state("postgres"), Some(NodeState::Pending));
}

#[tokio::test]
async fn test_cancelled_startup_marks_unfinished_nodes() {
    let closed = closed_address().await;
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(common::fast_config(&dir), manifest(&closed, &closed)).await.unwrap();
    common::init_and_unseal(&orchestrator).await;

    let cancel = CancellationToken::new();
    let coordinator = orchestrator.coordinator().clone();
    let runner = {
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let report = runner.await.unwrap();
    assert!(report.cancelled);
    assert!(report.ready.contains(&"redis".to_string()));
    assert!(matches!(orchestrator.coordinator().state("postgres"), Some(NodeState::Failed(_))));
}
