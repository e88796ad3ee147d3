use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::types::{CredentialRecord, SecretString, VersionMetadata};
use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::seal::SealManager;
use crate::storage::{SealedCell, StateDir, CREDENTIALS_FILE};

/// Length of generated service passwords
pub const GENERATED_PASSWORD_LEN: usize = 32;

/// Generate a random alphanumeric service password.
pub fn generate_password() -> SecretString {
    SecretString::new(Alphanumeric.sample_string(&mut rand::thread_rng(), GENERATED_PASSWORD_LEN))
}

/// Validate a store path: `[A-Za-z0-9/_-]` segments separated by single slashes.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::validation("path cannot be empty"));
    }
    if path.len() > 256 {
        return Err(Error::validation("path cannot exceed 256 characters"));
    }
    if path.contains("..") {
        return Err(Error::validation(format!("path '{}' contains traversal sequence", path)));
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::validation(format!("path '{}' has an empty segment", path)));
    }
    if !path.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-')) {
        return Err(Error::validation(format!(
            "path '{}' may only contain letters, digits, '/', '_' and '-'",
            path
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVersion {
    record: CredentialRecord,
    created_at: DateTime<Utc>,
    retired: bool,
}

impl StoredVersion {
    fn metadata(&self) -> VersionMetadata {
        VersionMetadata {
            version: self.record.version,
            created_at: self.created_at,
            retired: self.retired,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialHistory {
    paths: BTreeMap<String, Vec<StoredVersion>>,
}

impl CredentialHistory {
    fn current_version(&self, path: &str) -> u64 {
        self.paths.get(path).and_then(|versions| versions.last()).map(|v| v.record.version).unwrap_or(0)
    }

    fn append(&mut self, path: &str, mut record: CredentialRecord) -> u64 {
        let version = self.current_version(path) + 1;
        record.version = version;
        self.paths.entry(path.to_string()).or_default().push(StoredVersion {
            record,
            created_at: Utc::now(),
            retired: false,
        });
        version
    }
}

/// Versioned, append-only credential store behind the seal.
///
/// Every write creates a new version; nothing is mutated in place. All calls
/// fail fast with [`Error::Sealed`] while the seal is not unsealed. Writers are
/// serialized, so a rotation and a manual edit of the same path cannot lose
/// each other's update.
#[derive(Debug)]
pub struct SecretStore {
    history: SealedCell<CredentialHistory>,
}

impl SecretStore {
    pub fn new(seal: Arc<SealManager>, state_dir: Arc<StateDir>) -> Self {
        Self { history: SealedCell::new(seal, state_dir, CREDENTIALS_FILE) }
    }

    /// Store a new version of `path`. Returns the assigned version.
    #[instrument(skip(self, record))]
    pub async fn put(&self, path: &str, record: CredentialRecord) -> Result<u64> {
        validate_path(path)?;
        let version = self.history.update(|history| Ok(history.append(path, record))).await?;
        metrics::record_credential_write(path);
        info!(path, version, "stored credential version");
        Ok(version)
    }

    /// Store a new version only if the latest version is still `expected_version`
    /// (0 for a path that has never been written).
    #[instrument(skip(self, record))]
    pub async fn put_if_version(
        &self,
        path: &str,
        record: CredentialRecord,
        expected_version: u64,
    ) -> Result<u64> {
        validate_path(path)?;
        let version = self
            .history
            .update(|history| {
                let actual = history.current_version(path);
                if actual != expected_version {
                    return Err(Error::Conflict {
                        path: path.to_string(),
                        expected: expected_version,
                        actual,
                    });
                }
                Ok(history.append(path, record))
            })
            .await?;
        metrics::record_credential_write(path);
        info!(path, version, "stored credential version");
        Ok(version)
    }

    /// Fetch the latest version, or a specific one. Retired versions are not
    /// fetchable.
    pub async fn get(&self, path: &str, version: Option<u64>) -> Result<CredentialRecord> {
        validate_path(path)?;
        let history = self.history.read().await?;
        let versions = history.paths.get(path).ok_or_else(|| Error::not_found("path", path))?;

        match version {
            None => versions.last().map(|v| v.record.clone()).ok_or_else(|| Error::not_found("path", path)),
            Some(wanted) => versions
                .iter()
                .find(|v| v.record.version == wanted && !v.retired)
                .map(|v| v.record.clone())
                .ok_or_else(|| Error::not_found("version", format!("{}@{}", path, wanted))),
        }
    }

    /// Latest version number of `path`.
    pub async fn current_version(&self, path: &str) -> Result<u64> {
        validate_path(path)?;
        match self.history.read().await?.current_version(path) {
            0 => Err(Error::not_found("path", path)),
            version => Ok(version),
        }
    }

    /// Paths starting with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let history = self.history.read().await?;
        Ok(history.paths.keys().filter(|p| p.starts_with(prefix)).cloned().collect())
    }

    /// Version metadata for `path`, oldest first.
    pub async fn versions(&self, path: &str) -> Result<Vec<VersionMetadata>> {
        validate_path(path)?;
        let history = self.history.read().await?;
        let versions = history.paths.get(path).ok_or_else(|| Error::not_found("path", path))?;
        Ok(versions.iter().map(StoredVersion::metadata).collect())
    }

    /// Mark one version non-fetchable. The latest version can never be retired.
    #[instrument(skip(self))]
    pub async fn retire(&self, path: &str, version: u64) -> Result<()> {
        validate_path(path)?;
        self.history
            .update(|history| {
                let latest = history.current_version(path);
                if version == latest {
                    return Err(Error::validation(format!(
                        "cannot retire the latest version ({}) of '{}'",
                        version, path
                    )));
                }
                let entry = history
                    .paths
                    .get_mut(path)
                    .and_then(|versions| versions.iter_mut().find(|v| v.record.version == version))
                    .ok_or_else(|| Error::not_found("version", format!("{}@{}", path, version)))?;
                entry.retired = true;
                Ok(())
            })
            .await?;
        info!(path, version, "retired credential version");
        Ok(())
    }

    /// Retire every live version of `path` older than `keep`. Returns the
    /// versions retired by this call.
    #[instrument(skip(self))]
    pub async fn retire_before(&self, path: &str, keep: u64) -> Result<Vec<u64>> {
        validate_path(path)?;
        let retired = self
            .history
            .update(|history| {
                let latest = history.current_version(path);
                let versions =
                    history.paths.get_mut(path).ok_or_else(|| Error::not_found("path", path))?;
                let keep = keep.min(latest);
                Ok(versions
                    .iter_mut()
                    .filter(|v| v.record.version < keep && !v.retired)
                    .map(|v| {
                        v.retired = true;
                        v.record.version
                    })
                    .collect::<Vec<_>>())
            })
            .await?;
        if !retired.is_empty() {
            info!(path, versions = ?retired, "retired superseded credential versions");
        }
        Ok(retired)
    }

    /// Create a record with a generated password unless `path` already exists.
    /// Returns the new version, or `None` when the path was already populated.
    pub async fn ensure_record(&self, path: &str, template: CredentialRecord) -> Result<Option<u64>> {
        validate_path(path)?;
        if self.history.read().await?.current_version(path) != 0 {
            debug!(path, "credential record already present");
            return Ok(None);
        }
        let record = template.with_password(generate_password());
        match self.put_if_version(path, record, 0).await {
            Ok(version) => Ok(Some(version)),
            Err(Error::Conflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop decrypted state from memory (after a reseal).
    pub async fn clear(&self) {
        self.history.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn unsealed_store(dir: &TempDir) -> (Arc<SealManager>, SecretStore) {
        let state_dir = Arc::new(StateDir::open(dir.path()).await.unwrap());
        let seal = Arc::new(SealManager::open(state_dir.clone()).await.unwrap());
        let init = seal.initialize(1, 1).await.unwrap();
        seal.unseal(init.shares[0].expose_secret()).await;
        std::fs::write(dir.path().join("share"), init.shares[0].expose_secret()).unwrap();
        (seal.clone(), SecretStore::new(seal, state_dir))
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("postgres").is_ok());
        assert!(validate_path("redis/redis-1").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("../etc").is_err());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("trailing/").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("has space").is_err());
    }

    #[test]
    fn test_generated_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.len(), GENERATED_PASSWORD_LEN);
        assert!(pw.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pw, generate_password());
    }

    #[tokio::test]
    async fn test_sealed_store_fails_fast() {
        let dir = TempDir::new().unwrap();
        let state_dir = Arc::new(StateDir::open(dir.path()).await.unwrap());
        let seal = Arc::new(SealManager::open(state_dir.clone()).await.unwrap());
        let store = SecretStore::new(seal, state_dir);

        let record = CredentialRecord::new("svc-a", "u", "p");
        assert!(matches!(store.put("svc-a", record).await, Err(Error::Sealed)));
        assert!(matches!(store.get("svc-a", None).await, Err(Error::Sealed)));
        assert!(matches!(store.list("").await, Err(Error::Sealed)));
    }

    #[tokio::test]
    async fn test_put_get_versions_increase() {
        let dir = TempDir::new().unwrap();
        let (_seal, store) = unsealed_store(&dir).await;

        let v1 = store.put("svc-a", CredentialRecord::new("svc-a", "admin", "one")).await.unwrap();
        let v2 = store.put("svc-a", CredentialRecord::new("svc-a", "admin", "two")).await.unwrap();
        assert_eq!((v1, v2), (1, 2));

        let latest = store.get("svc-a", None).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.password.expose_secret(), "two");
        assert_eq!(store.get("svc-a", Some(1)).await.unwrap().password.expose_secret(), "one");
        assert_eq!(store.current_version("svc-a").await.unwrap(), 2);

        assert!(matches!(store.get("missing", None).await, Err(Error::NotFound { .. })));
        assert!(matches!(store.get("svc-a", Some(9)).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let dir = TempDir::new().unwrap();
        let (_seal, store) = unsealed_store(&dir).await;
        for path in ["redis-1", "redis-2", "postgres"] {
            store.put(path, CredentialRecord::new(path, "u", "p")).await.unwrap();
        }
        assert_eq!(store.list("redis").await.unwrap(), vec!["redis-1", "redis-2"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_put_if_version_detects_conflict() {
        let dir = TempDir::new().unwrap();
        let (_seal, store) = unsealed_store(&dir).await;

        let record = CredentialRecord::new("svc-a", "u", "p");
        assert_eq!(store.put_if_version("svc-a", record.clone(), 0).await.unwrap(), 1);
        let err = store.put_if_version("svc-a", record.clone(), 0).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.put_if_version("svc-a", record, 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retire_rules() {
        let dir = TempDir::new().unwrap();
        let (_seal, store) = unsealed_store(&dir).await;
        for pw in ["a", "b", "c"] {
            store.put("svc-a", CredentialRecord::new("svc-a", "u", pw)).await.unwrap();
        }

        assert!(matches!(store.retire("svc-a", 3).await, Err(Error::Validation(_))));
        store.retire("svc-a", 1).await.unwrap();
        store.retire("svc-a", 1).await.unwrap();
        assert!(store.get("svc-a", Some(1)).await.is_err());

        assert_eq!(store.retire_before("svc-a", 3).await.unwrap(), vec![2]);
        let meta = store.versions("svc-a").await.unwrap();
        assert_eq!(meta.iter().map(|m| m.retired).collect::<Vec<_>>(), vec![true, true, false]);
        assert_eq!(store.get("svc-a", None).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_history_survives_restart_and_reseal() {
        let dir = TempDir::new().unwrap();
        let (seal, store) = unsealed_store(&dir).await;
        store.put("svc-a", CredentialRecord::new("svc-a", "u", "persisted")).await.unwrap();

        seal.seal().await.unwrap();
        store.clear().await;
        assert!(matches!(store.get("svc-a", None).await, Err(Error::Sealed)));

        let share = std::fs::read_to_string(dir.path().join("share")).unwrap();
        let state_dir = Arc::new(StateDir::open(dir.path()).await.unwrap());
        let reopened = Arc::new(SealManager::open(state_dir.clone()).await.unwrap());
        reopened.unseal(&share).await;
        let store = SecretStore::new(reopened, state_dir);
        assert_eq!(store.get("svc-a", None).await.unwrap().password.expose_secret(), "persisted");
    }

    #[tokio::test]
    async fn test_ensure_record_generates_once() {
        let dir = TempDir::new().unwrap();
        let (_seal, store) = unsealed_store(&dir).await;
        let template = CredentialRecord::new("mysql", "dev_admin", "").with_field("database", "dev");

        assert_eq!(store.ensure_record("mysql", template.clone()).await.unwrap(), Some(1));
        assert_eq!(store.ensure_record("mysql", template).await.unwrap(), None);

        let record = store.get("mysql", None).await.unwrap();
        assert_eq!(record.password.len(), GENERATED_PASSWORD_LEN);
        assert_eq!(record.extra_fields.get("database").map(String::as_str), Some("dev"));
    }
}
