//! CA hierarchy as seen by a TLS client: parse the exported PEMs and check
//! the chain, the constraints and the validity nesting.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use vaultkeeper::broker::CredentialSource;
use vaultkeeper::pki::CertificateStatus;
use vaultkeeper::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

fn not_after(cert: &X509Certificate<'_>) -> i64 {
    cert.validity().not_after.timestamp()
}

fn parse_all(bundle: &str) -> Vec<Pem> {
    Pem::iter_from_buffer(bundle.as_bytes()).map(|pem| pem.unwrap()).collect()
}

#[tokio::test]
async fn test_exported_chain_verifies_leaf_to_root() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    common::init_and_unseal(&orchestrator).await;

    let bundle = orchestrator.tls_material("postgres").await.unwrap();
    let hierarchy = orchestrator.ca().hierarchy().await.unwrap();

    let leaf_pem = parse_all(&bundle.certificate_pem).remove(0);
    let leaf = leaf_pem.parse_x509().unwrap();
    let ca_pems = parse_all(&bundle.ca_bundle_pem);
    assert_eq!(ca_pems.len(), 2, "bundle carries intermediate and root");
    let intermediate = ca_pems[0].parse_x509().unwrap();
    let root = ca_pems[1].parse_x509().unwrap();

    assert!(root.is_ca());
    assert!(intermediate.is_ca());
    assert!(!leaf.is_ca());
    assert_eq!(root.subject(), root.issuer());
    assert_eq!(intermediate.issuer(), root.subject());
    assert_eq!(leaf.issuer(), intermediate.subject());

    root.verify_signature(None).unwrap();
    intermediate.verify_signature(Some(root.public_key())).unwrap();
    leaf.verify_signature(Some(intermediate.public_key())).unwrap();

    // validity windows nest
    assert!(not_after(&leaf) <= not_after(&intermediate));
    assert!(not_after(&intermediate) <= not_after(&root));
    assert_eq!(not_after(&intermediate), hierarchy.intermediate.not_after.timestamp());

    let names: Vec<String> = leaf
        .subject_alternative_name()
        .unwrap()
        .expect("leaf carries SANs")
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) if bytes.len() == 4 => {
                Some(format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]))
            }
            _ => None,
        })
        .collect();
    assert!(names.contains(&"postgres".to_string()));
    assert!(names.contains(&"localhost".to_string()));
    assert!(names.contains(&"127.0.0.1".to_string()));
}

#[tokio::test]
async fn test_issue_is_bounded_by_role() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    common::init_and_unseal(&orchestrator).await;
    let ca = orchestrator.ca();

    ca.define_role("api", vec!["api.local".into(), "*.api.local".into()], Duration::from_secs(24 * 3600), 256)
        .await
        .unwrap();

    let leaf = ca.issue("api", Duration::from_secs(3600), vec!["v1.api.local".into()]).await.unwrap();
    assert_eq!(leaf.common_name, "v1.api.local");
    assert_eq!((leaf.not_after - leaf.not_before).num_seconds(), 3600);

    let too_long = ca.issue("api", Duration::from_secs(48 * 3600), vec!["api.local".into()]).await;
    assert!(matches!(too_long, Err(Error::PolicyViolation { .. })));

    let foreign = ca.issue("api", Duration::from_secs(3600), vec!["evil.example".into()]).await;
    assert!(matches!(foreign, Err(Error::PolicyViolation { .. })));

    let again = ca.bootstrap(Duration::from_secs(3600), Duration::from_secs(60)).await;
    assert!(matches!(again, Err(Error::AlreadyBootstrapped)));
}

#[tokio::test]
async fn test_renewal_keeps_superseded_leaf_until_reload() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    common::init_and_unseal(&orchestrator).await;
    let ca = orchestrator.ca();

    let first = ca.active_leaf("pgbouncer").await.unwrap().expect("bootstrap issued a leaf");
    let renewed = ca.renew("pgbouncer").await.unwrap();
    assert!(renewed.serial_number > first.serial_number);

    let status_of = |serial: u64| {
        let ca = ca.clone();
        async move {
            ca.ledger().await.unwrap().into_iter().find(|e| e.serial_number == serial).map(|e| e.status)
        }
    };
    assert_eq!(status_of(first.serial_number).await, Some(CertificateStatus::Superseded));

    let retired = ca.confirm_reload("pgbouncer").await.unwrap();
    assert_eq!(retired, vec![first.serial_number]);
    assert_eq!(status_of(first.serial_number).await, Some(CertificateStatus::Retired));
    assert!(!ca.is_revoked(first.serial_number).await.unwrap());
    assert_eq!(orchestrator.tls_material("pgbouncer").await.unwrap().serial_number, renewed.serial_number);
}

#[tokio::test]
async fn test_revoked_active_leaf_is_not_exported() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    common::init_and_unseal(&orchestrator).await;

    let active = orchestrator.ca().active_leaf("postgres").await.unwrap().unwrap();
    let entry = orchestrator.ca().revoke(active.serial_number).await.unwrap();
    assert_eq!(entry.status, CertificateStatus::Revoked);
    assert!(entry.revoked_at.is_some());

    assert!(matches!(orchestrator.tls_material("postgres").await, Err(Error::NotFound { .. })));
    assert!(matches!(orchestrator.tls_material("redis").await, Err(Error::NotConfigured { .. })));
}
