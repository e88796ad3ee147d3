//! Versioned per-service credential storage.
//!
//! The [`SecretStore`] keeps an append-only history of [`CredentialRecord`]s per
//! path, encrypted at rest with the seal's master key. Versions are totally
//! ordered per path and start at 1; the latest version is what brokers hand out,
//! while older versions stay fetchable by number until the rotation scheduler
//! retires them after a healthy restart.
//!
//! ```rust,ignore
//! let version = store.put("postgres", CredentialRecord::new("postgres", "dev_admin", pw)).await?;
//! let record = store.get("postgres", None).await?;
//! assert_eq!(record.version, version);
//! ```

pub mod store;
pub mod types;

pub use store::{generate_password, validate_path, SecretStore, GENERATED_PASSWORD_LEN};
pub use types::{exposed, CredentialRecord, SecretString, VersionMetadata};
