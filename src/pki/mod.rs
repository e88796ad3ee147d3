//! # Certificate Authority Hierarchy
//!
//! A root authority signs one intermediate; the intermediate signs per-service
//! leaf certificates under named roles. Both authority keys live in the sealed
//! PKI state and are generated exactly once at bootstrap.
//!
//! A leaf is never deleted. Reissuing for a service marks the previous leaf
//! `Superseded` (still valid, so the service never runs without a usable
//! certificate); [`CertificateAuthority::confirm_reload`] retires it once the
//! service has picked up the replacement.

pub mod authority;
pub mod role;
pub mod types;

pub use authority::{CertificateAuthority, INTERMEDIATE_COMMON_NAME, ROOT_COMMON_NAME};
pub use role::Role;
pub use types::{
    AuthorityInfo, CaHierarchy, CertificateStatus, KeySize, LeafCertificate, LedgerEntry, TlsBundle,
};
