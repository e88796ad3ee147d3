use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rcgen::SignatureAlgorithm;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::secrets::{exposed, SecretString};

/// Leaf key sizes a role may request, in bits of the ECDSA curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum KeySize {
    P256,
    P384,
}

impl KeySize {
    pub fn bits(&self) -> u16 {
        match self {
            KeySize::P256 => 256,
            KeySize::P384 => 384,
        }
    }

    pub fn algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeySize::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeySize::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

impl TryFrom<u16> for KeySize {
    type Error = Error;

    fn try_from(bits: u16) -> Result<Self> {
        match bits {
            256 => Ok(KeySize::P256),
            384 => Ok(KeySize::P384),
            other => Err(Error::policy(format!(
                "unsupported key size {} (supported: 256, 384)",
                other
            ))),
        }
    }
}

impl From<KeySize> for u16 {
    fn from(size: KeySize) -> Self {
        size.bits()
    }
}

/// Root or intermediate authority as persisted behind the seal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAuthority {
    pub common_name: String,
    pub serial_number: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub certificate_pem: String,
    #[serde(with = "exposed")]
    pub private_key_pem: SecretString,
}

impl StoredAuthority {
    pub fn info(&self) -> AuthorityInfo {
        AuthorityInfo {
            common_name: self.common_name.clone(),
            serial_number: self.serial_number,
            not_before: self.not_before,
            not_after: self.not_after,
            certificate_pem: self.certificate_pem.clone(),
        }
    }
}

/// Public view of an authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityInfo {
    pub common_name: String,
    pub serial_number: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub certificate_pem: String,
}

/// Public view of the two-tier hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaHierarchy {
    pub root: AuthorityInfo,
    pub intermediate: AuthorityInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// The service's current certificate
    Active,
    /// Replaced by a newer issuance, kept until the service confirms reload
    Superseded,
    /// Superseded and no longer in use
    Retired,
    Revoked,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Superseded => "superseded",
            CertificateStatus::Retired => "retired",
            CertificateStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// One row of the issued-certificate ledger. Never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub serial_number: u64,
    pub service_id: String,
    pub common_name: String,
    pub subject_alt_names: BTreeSet<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: CertificateStatus,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A freshly issued leaf certificate with its private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCertificate {
    pub service_id: String,
    pub common_name: String,
    pub subject_alt_names: BTreeSet<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: u64,
    pub certificate_pem: String,
    #[serde(with = "exposed")]
    pub private_key_pem: SecretString,
}

/// Everything a service needs to serve TLS: its leaf, key, and the chain to the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsBundle {
    pub service_id: String,
    pub serial_number: u64,
    pub not_after: DateTime<Utc>,
    pub certificate_pem: String,
    #[serde(with = "exposed")]
    pub private_key_pem: SecretString,
    /// Intermediate followed by root, PEM-concatenated
    pub ca_bundle_pem: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_size_parsing() {
        assert_eq!(KeySize::try_from(256).unwrap(), KeySize::P256);
        assert_eq!(KeySize::try_from(384).unwrap().bits(), 384);
        assert!(matches!(KeySize::try_from(2048), Err(Error::PolicyViolation { .. })));

        let parsed: KeySize = serde_json::from_str("384").unwrap();
        assert_eq!(parsed, KeySize::P384);
        assert_eq!(serde_json::to_string(&KeySize::P256).unwrap(), "256");
        assert!(serde_json::from_str::<KeySize>("512").is_err());
    }

    #[test]
    fn test_tls_bundle_serializes_key() {
        let bundle = TlsBundle {
            service_id: "postgres".into(),
            serial_number: 3,
            not_after: Utc::now(),
            certificate_pem: "CERT".into(),
            private_key_pem: SecretString::new("KEY"),
            ca_bundle_pem: "CA".into(),
        };
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(json.contains("\"private_key_pem\":\"KEY\""));
        assert!(!format!("{:?}", bundle).contains("KEY\""));
    }
}
