use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, instrument, warn, Instrument};

use super::role::Role;
use super::types::{
    AuthorityInfo, CaHierarchy, CertificateStatus, LeafCertificate, LedgerEntry, StoredAuthority,
    TlsBundle,
};
use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::seal::SealManager;
use crate::secrets::{exposed, SecretString};
use crate::storage::{SealedCell, StateDir, PKI_FILE};

pub const ROOT_COMMON_NAME: &str = "vaultkeeper Root CA";
pub const INTERMEDIATE_COMMON_NAME: &str = "vaultkeeper Intermediate CA";
const ORGANIZATION: &str = "vaultkeeper";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssuedCertificate {
    entry: LedgerEntry,
    certificate_pem: String,
    /// Emptied once the certificate is retired or revoked
    #[serde(with = "exposed")]
    private_key_pem: SecretString,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PkiState {
    root: Option<StoredAuthority>,
    intermediate: Option<StoredAuthority>,
    roles: BTreeMap<String, Role>,
    certificates: BTreeMap<u64, IssuedCertificate>,
    last_serial: u64,
}

impl PkiState {
    fn authorities(&self) -> Result<(&StoredAuthority, &StoredAuthority)> {
        match (&self.root, &self.intermediate) {
            (Some(root), Some(intermediate)) => Ok((root, intermediate)),
            _ => Err(Error::not_found("certificate authority", "intermediate")),
        }
    }

    fn next_serial(&mut self) -> u64 {
        self.last_serial += 1;
        self.last_serial
    }

    fn active_for(&self, service_id: &str) -> Option<&IssuedCertificate> {
        self.certificates
            .values()
            .rev()
            .find(|c| c.entry.service_id == service_id && c.entry.status == CertificateStatus::Active)
    }

    fn ca_bundle(&self) -> Result<String> {
        let (root, intermediate) = self.authorities()?;
        Ok(format!("{}{}", intermediate.certificate_pem, root.certificate_pem))
    }
}

/// Two-tier certificate authority: one root, one intermediate, and role-bound
/// leaf issuance.
///
/// Validity windows nest strictly: root > intermediate > any leaf, and every
/// leaf's `not_after` falls inside the intermediate's window. Serial numbers
/// are allocated from one persisted counter and never reused.
#[derive(Debug)]
pub struct CertificateAuthority {
    state: SealedCell<PkiState>,
}

impl CertificateAuthority {
    pub fn new(seal: Arc<SealManager>, state_dir: Arc<StateDir>) -> Self {
        Self { state: SealedCell::new(seal, state_dir, PKI_FILE) }
    }

    /// Generate the root and intermediate authorities. One-time.
    #[instrument(skip(self))]
    pub async fn bootstrap(
        &self,
        root_validity: Duration,
        intermediate_validity: Duration,
    ) -> Result<CaHierarchy> {
        let hierarchy = self
            .state
            .update(|state| {
                if state.root.is_some() {
                    return Err(Error::AlreadyBootstrapped);
                }
                if intermediate_validity.is_zero() || root_validity <= intermediate_validity {
                    return Err(Error::validity(format!(
                        "root validity ({}h) must be strictly greater than intermediate validity ({}h)",
                        root_validity.as_secs() / 3600,
                        intermediate_validity.as_secs() / 3600
                    )));
                }
                if let Some(role) = state.roles.values().find(|r| r.max_ttl >= intermediate_validity) {
                    return Err(Error::validity(format!(
                        "intermediate validity ({}h) must exceed max_ttl of role '{}'",
                        intermediate_validity.as_secs() / 3600,
                        role.service_id
                    )));
                }

                let now = Utc::now().trunc_subsecs(0);
                let root_serial = state.next_serial();
                let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
                let root_not_after = add_window(now, root_validity)?;
                let root_cert = authority_params(ROOT_COMMON_NAME, root_serial, now, root_not_after, None)?
                    .self_signed(&root_key)?;

                let intermediate_serial = state.next_serial();
                let intermediate_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
                let intermediate_not_after = add_window(now, intermediate_validity)?;
                let intermediate_cert = authority_params(
                    INTERMEDIATE_COMMON_NAME,
                    intermediate_serial,
                    now,
                    intermediate_not_after,
                    Some(0),
                )?
                .signed_by(&intermediate_key, &root_cert, &root_key)?;

                let root = StoredAuthority {
                    common_name: ROOT_COMMON_NAME.to_string(),
                    serial_number: root_serial,
                    not_before: now,
                    not_after: root_not_after,
                    certificate_pem: root_cert.pem(),
                    private_key_pem: SecretString::new(root_key.serialize_pem()),
                };
                let intermediate = StoredAuthority {
                    common_name: INTERMEDIATE_COMMON_NAME.to_string(),
                    serial_number: intermediate_serial,
                    not_before: now,
                    not_after: intermediate_not_after,
                    certificate_pem: intermediate_cert.pem(),
                    private_key_pem: SecretString::new(intermediate_key.serialize_pem()),
                };
                let hierarchy = CaHierarchy { root: root.info(), intermediate: intermediate.info() };
                state.root = Some(root);
                state.intermediate = Some(intermediate);
                Ok(hierarchy)
            })
            .await?;

        info!(
            root_not_after = %hierarchy.root.not_after,
            intermediate_not_after = %hierarchy.intermediate.not_after,
            "CA hierarchy bootstrapped"
        );
        Ok(hierarchy)
    }

    pub async fn is_bootstrapped(&self) -> Result<bool> {
        Ok(self.state.read().await?.root.is_some())
    }

    pub async fn hierarchy(&self) -> Result<CaHierarchy> {
        let state = self.state.read().await?;
        let (root, intermediate) = state.authorities()?;
        Ok(CaHierarchy { root: root.info(), intermediate: intermediate.info() })
    }

    pub async fn intermediate(&self) -> Result<AuthorityInfo> {
        Ok(self.hierarchy().await?.intermediate)
    }

    /// Register or replace the issuance policy for `service_id`.
    #[instrument(skip(self, allowed_common_names))]
    pub async fn define_role(
        &self,
        service_id: &str,
        allowed_common_names: Vec<String>,
        max_ttl: Duration,
        key_size_bits: u16,
    ) -> Result<Role> {
        let role = Role::new(service_id, allowed_common_names, max_ttl, key_size_bits)?;
        let stored = role.clone();
        self.state
            .update(move |state| {
                if let Some(intermediate) = &state.intermediate {
                    let window = (intermediate.not_after - intermediate.not_before)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if stored.max_ttl >= window {
                        return Err(Error::validity(format!(
                            "max_ttl {}h must be shorter than the intermediate validity {}h",
                            stored.max_ttl.as_secs() / 3600,
                            window.as_secs() / 3600
                        )));
                    }
                }
                state.roles.insert(stored.service_id.clone(), stored);
                Ok(())
            })
            .await?;
        info!(service_id, max_ttl_secs = role.max_ttl.as_secs(), "PKI role defined");
        Ok(role)
    }

    pub async fn role(&self, service_id: &str) -> Result<Role> {
        self.state
            .read()
            .await?
            .roles
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::not_found("role", service_id))
    }

    pub async fn roles(&self) -> Result<Vec<Role>> {
        Ok(self.state.read().await?.roles.values().cloned().collect())
    }

    /// Issue a leaf for `service_id` under its role. The previous active leaf
    /// becomes `Superseded` and stays exportable from the ledger until
    /// [`CertificateAuthority::confirm_reload`].
    pub async fn issue(
        &self,
        service_id: &str,
        requested_ttl: Duration,
        subject_alt_names: Vec<String>,
    ) -> Result<LeafCertificate> {
        let span = crate::pki_span!("issue", service_id);
        async move {
            let leaf = self
                .state
                .update(|state| issue_leaf(state, service_id, requested_ttl, subject_alt_names))
                .await?;

            metrics::record_certificate_issued(&leaf.service_id);
            info!(
                serial = leaf.serial_number,
                not_after = %leaf.not_after,
                common_name = %leaf.common_name,
                "issued leaf certificate"
            );
            Ok(leaf)
        }
        .instrument(span)
        .await
    }

    /// Issue a replacement for the service's most recent leaf, keeping its names
    /// and lifetime. Falls back to the role's default name and max TTL.
    pub async fn renew(&self, service_id: &str) -> Result<LeafCertificate> {
        let (ttl, names) = {
            let state = self.state.read().await?;
            let role = state
                .roles
                .get(service_id)
                .ok_or_else(|| Error::policy(format!("no PKI role defined for '{}'", service_id)))?;
            let previous = state.certificates.values().rev().find(|c| c.entry.service_id == service_id);
            match previous {
                Some(prev) => {
                    let ttl = (prev.entry.not_after - prev.entry.not_before).to_std().unwrap_or(role.max_ttl);
                    let mut names = vec![prev.entry.common_name.clone()];
                    names.extend(prev.entry.subject_alt_names.iter().filter(|n| **n != prev.entry.common_name).cloned());
                    (ttl.min(role.max_ttl), names)
                }
                None => (role.max_ttl, Vec::new()),
            }
        };
        self.issue(service_id, ttl, names).await
    }

    /// Add `serial` to the revocation set. The ledger row is kept.
    #[instrument(skip(self))]
    pub async fn revoke(&self, serial_number: u64) -> Result<LedgerEntry> {
        let entry = self
            .state
            .update(|state| {
                let cert = state
                    .certificates
                    .get_mut(&serial_number)
                    .ok_or_else(|| Error::not_found("certificate", serial_number.to_string()))?;
                if cert.entry.status != CertificateStatus::Revoked {
                    cert.entry.status = CertificateStatus::Revoked;
                    cert.entry.revoked_at = Some(Utc::now());
                    cert.private_key_pem = SecretString::default();
                }
                Ok(cert.entry.clone())
            })
            .await?;
        warn!(serial = serial_number, service_id = %entry.service_id, "certificate revoked");
        Ok(entry)
    }

    pub async fn is_revoked(&self, serial_number: u64) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await?
            .certificates
            .get(&serial_number)
            .is_some_and(|c| c.entry.status == CertificateStatus::Revoked))
    }

    /// The consuming service reloaded its new certificate: retire superseded leaves.
    #[instrument(skip(self))]
    pub async fn confirm_reload(&self, service_id: &str) -> Result<Vec<u64>> {
        let service = service_id.to_string();
        let retired = self
            .state
            .update(move |state| {
                Ok(state
                    .certificates
                    .values_mut()
                    .filter(|c| c.entry.service_id == service && c.entry.status == CertificateStatus::Superseded)
                    .map(|c| {
                        c.entry.status = CertificateStatus::Retired;
                        c.private_key_pem = SecretString::default();
                        c.entry.serial_number
                    })
                    .collect::<Vec<_>>())
            })
            .await?;
        if !retired.is_empty() {
            info!(service_id, serials = ?retired, "retired superseded certificates");
        }
        Ok(retired)
    }

    /// Active leaf, its key, and the chain up to the root.
    pub async fn export_chain(&self, service_id: &str) -> Result<TlsBundle> {
        let state = self.state.read().await?;
        let active =
            state.active_for(service_id).ok_or_else(|| Error::not_found("certificate", service_id))?;
        Ok(TlsBundle {
            service_id: service_id.to_string(),
            serial_number: active.entry.serial_number,
            not_after: active.entry.not_after,
            certificate_pem: active.certificate_pem.clone(),
            private_key_pem: active.private_key_pem.clone(),
            ca_bundle_pem: state.ca_bundle()?,
        })
    }

    /// Intermediate and root certificates, PEM-concatenated.
    pub async fn export_ca_bundle(&self) -> Result<String> {
        self.state.read().await?.ca_bundle()
    }

    pub async fn active_leaf(&self, service_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.state.read().await?.active_for(service_id).map(|c| c.entry.clone()))
    }

    /// Every issued leaf, in serial order.
    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.state.read().await?.certificates.values().map(|c| c.entry.clone()).collect())
    }

    pub async fn clear(&self) {
        self.state.clear().await;
    }
}

fn issue_leaf(
    state: &mut PkiState,
    service_id: &str,
    requested_ttl: Duration,
    subject_alt_names: Vec<String>,
) -> Result<LeafCertificate> {
    let role = state
        .roles
        .get(service_id)
        .cloned()
        .ok_or_else(|| Error::policy(format!("no PKI role defined for '{}'", service_id)))?;

    let mut names: Vec<String> = Vec::new();
    for name in subject_alt_names.iter().map(|n| n.trim().to_ascii_lowercase()) {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    if names.is_empty() {
        let default = role.default_name().ok_or_else(|| {
            Error::policy(format!("role '{}' has no default name; request at least one SAN", service_id))
        })?;
        names.push(default.to_string());
    }
    role.check(requested_ttl, &names)?;

    let (_, intermediate) = state.authorities()?;
    let now = Utc::now().trunc_subsecs(0);
    let not_after = add_window(now, requested_ttl)?;
    if not_after > intermediate.not_after {
        return Err(Error::validity(format!(
            "leaf not_after {} would outlive the intermediate (not_after {})",
            not_after, intermediate.not_after
        )));
    }
    let (issuer_cert, issuer_key) = load_issuer(intermediate, Some(0))?;

    let serial = state.next_serial();
    let common_name = names[0].clone();

    let mut params = CertificateParams::new(names.clone())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.as_str());
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages =
        vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    params.not_before = to_offset(now)?;
    params.not_after = to_offset(not_after)?;
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    params.use_authority_key_identifier_extension = true;

    let key = KeyPair::generate_for(role.key_size.algorithm())?;
    let cert = params.signed_by(&key, &issuer_cert, &issuer_key)?;

    for previous in state.certificates.values_mut().filter(|c| {
        c.entry.service_id == service_id && c.entry.status == CertificateStatus::Active
    }) {
        previous.entry.status = CertificateStatus::Superseded;
    }

    let subject_alt_names: BTreeSet<String> = names.into_iter().collect();
    let leaf = LeafCertificate {
        service_id: service_id.to_string(),
        common_name,
        subject_alt_names,
        not_before: now,
        not_after,
        serial_number: serial,
        certificate_pem: cert.pem(),
        private_key_pem: SecretString::new(key.serialize_pem()),
    };
    state.certificates.insert(
        serial,
        IssuedCertificate {
            entry: LedgerEntry {
                serial_number: serial,
                service_id: leaf.service_id.clone(),
                common_name: leaf.common_name.clone(),
                subject_alt_names: leaf.subject_alt_names.clone(),
                not_before: leaf.not_before,
                not_after: leaf.not_after,
                status: CertificateStatus::Active,
                issued_at: Utc::now(),
                revoked_at: None,
            },
            certificate_pem: leaf.certificate_pem.clone(),
            private_key_pem: leaf.private_key_pem.clone(),
        },
    );
    Ok(leaf)
}

fn authority_params(
    common_name: &str,
    serial: u64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    path_len: Option<u8>,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(match path_len {
        Some(len) => BasicConstraints::Constrained(len),
        None => BasicConstraints::Unconstrained,
    });
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    Ok(params)
}

/// Rebuild a signing handle for a stored authority from its key and metadata.
fn load_issuer(authority: &StoredAuthority, path_len: Option<u8>) -> Result<(Certificate, KeyPair)> {
    let key = KeyPair::from_pem(authority.private_key_pem.expose_secret())?;
    let cert = authority_params(
        &authority.common_name,
        authority.serial_number,
        authority.not_before,
        authority.not_after,
        path_len,
    )?
    .self_signed(&key)?;
    Ok((cert, key))
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::certificate(format!("timestamp out of range: {}", e)))
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| Error::validity(format!("duration {:?} is out of range", duration)))
}

/// `start + window`, or `InvalidValidityWindow` past the representable date range.
fn add_window(start: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    start
        .checked_add_signed(to_chrono(window)?)
        .ok_or_else(|| Error::validity(format!("validity of {}h ends past the supported date range", window.as_secs() / 3600)))
}
