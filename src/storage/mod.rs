//! # Storage and Persistence
//!
//! File-backed persistence for the orchestrator's durable state. Everything lives
//! under one state directory:
//!
//! ```text
//! <data_dir>/
//!   seal.json            seal metadata (share count, threshold, verification canary)
//!   keys.json            unseal-key backup artifact (0600, may live elsewhere)
//!   credentials.sealed   versioned credential history, encrypted with the master key
//!   pki.sealed           CA hierarchy, roles and issued-certificate ledger, encrypted
//!   tokens.json          SHA-256 hashes of service and admin tokens
//!   audit.jsonl          append-only audit log
//! ```
//!
//! Writes go to a temporary sibling file and are renamed into place so a crash
//! never leaves a half-written snapshot behind.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{Error, Result};

pub mod sealed;

pub use sealed::SealedCell;

pub const SEAL_FILE: &str = "seal.json";
pub const KEYS_FILE: &str = "keys.json";
pub const CREDENTIALS_FILE: &str = "credentials.sealed";
pub const PKI_FILE: &str = "pki.sealed";
pub const TOKENS_FILE: &str = "tokens.json";
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Directory holding all persisted orchestrator state.
#[derive(Debug)]
pub struct StateDir {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl StateDir {
    /// Open (and create if needed) the state directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(e, format!("creating state directory {}", root.display())))?;
        Ok(Self { root, append_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path(name)).await.unwrap_or(false)
    }

    /// Read a JSON document, returning `None` when the file does not exist.
    pub async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        read_json_file(&self.path(name)).await
    }

    /// Atomically replace a JSON document.
    pub async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        write_json_file(&self.path(name), value, false).await
    }

    /// Atomically replace a JSON document readable only by the owner.
    pub async fn write_private_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        write_json_file(&self.path(name), value, true).await
    }

    /// Append one line to a log-style file.
    pub async fn append_line(&self, name: &str, line: &str) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        let path = self.path(name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::io(e, format!("opening {}", path.display())))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every line of a log-style file; missing files read as empty.
    pub async fn read_lines(&self, name: &str) -> Result<Vec<String>> {
        let path = self.path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::io(e, format!("reading {}", path.display()))),
        }
    }
}

/// Read a JSON file from an arbitrary path.
pub async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::serialization(e, format!("parsing {}", path.display())))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(e, format!("reading {}", path.display()))),
    }
}

/// Write a JSON file atomically (temp file + rename).
pub async fn write_json_file<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(e, format!("creating {}", parent.display())))?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| Error::io(e, format!("writing {}", tmp.display())))?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = private;

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::io(e, format!("renaming into {}", path.display())))?;

    debug!(path = %path.display(), bytes = bytes.len(), "persisted state file");
    Ok(())
}
