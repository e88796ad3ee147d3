//! Persisted seal metadata and the unseal-key backup artifact.
//!
//! `seal.json` records how the master key was split and a verification canary
//! encrypted with it; it never contains shares. `keys.json` is the operator's
//! backup of every share plus the admin token. Losing more than
//! `shares - threshold` of those shares makes the store permanently
//! unrecoverable; nothing in this crate can regenerate them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::barrier::SealedBlob;
use crate::errors::Result;
use crate::secrets::SecretString;
use crate::storage::{read_json_file, write_json_file};

/// Contents of `seal.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealMetadata {
    pub shares: u8,
    pub threshold: u8,
    pub canary: SealedBlob,
    pub initialized_at: DateTime<Utc>,
    /// Last observed auto-unseal policy, recorded on every process start.
    #[serde(default)]
    pub auto_unseal: bool,
}

/// Contents of `keys.json`.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyBackup {
    pub unseal_keys_b64: Vec<String>,
    pub admin_token: String,
    pub shares: u8,
    pub threshold: u8,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for KeyBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBackup")
            .field("unseal_keys_b64", &format!("[{} REDACTED]", self.unseal_keys_b64.len()))
            .field("admin_token", &"[REDACTED]")
            .field("shares", &self.shares)
            .field("threshold", &self.threshold)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl KeyBackup {
    pub fn new(shares: &[SecretString], admin_token: &SecretString, threshold: u8) -> Self {
        Self {
            unseal_keys_b64: shares.iter().map(|s| s.expose_secret().to_string()).collect(),
            admin_token: admin_token.expose_secret().to_string(),
            shares: shares.len() as u8,
            threshold,
            created_at: Utc::now(),
        }
    }

    /// Shares as redacting strings.
    pub fn share_secrets(&self) -> Vec<SecretString> {
        self.unseal_keys_b64.iter().map(|s| SecretString::new(s.clone())).collect()
    }

    /// Read a backup from `path`; `None` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        read_json_file(path).await
    }

    /// Write the backup owner-readable only.
    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_file(path, self, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_backup_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.json");

        let shares = vec![SecretString::new("AQID"), SecretString::new("AgME")];
        let backup = KeyBackup::new(&shares, &SecretString::new("vk_admin_x"), 2);
        backup.save(&path).await.unwrap();

        let loaded = KeyBackup::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.share_secrets(), shares);
        assert_eq!(loaded.admin_token, "vk_admin_x");
        assert_eq!((loaded.shares, loaded.threshold), (2, 2));

        assert!(KeyBackup::load(&dir.path().join("missing.json")).await.unwrap().is_none());
    }

    #[test]
    fn test_debug_redacts_shares() {
        let backup = KeyBackup::new(&[SecretString::new("AQID")], &SecretString::new("tok"), 1);
        let debug = format!("{:?}", backup);
        assert!(!debug.contains("AQID"));
        assert!(!debug.contains("tok\""));
    }
}
