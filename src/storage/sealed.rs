//! State persisted behind the seal barrier.
//!
//! A [`SealedCell`] holds one JSON document encrypted with the master key. It is
//! decrypted lazily on first use after each unseal and cached in memory until
//! the next reseal. Updates are applied to a copy, persisted, and only then made
//! visible, so a failed write never leaves memory ahead of disk.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::StateDir;
use crate::errors::{Error, Result};
use crate::seal::{SealManager, SealedBlob};

struct Cached<T> {
    epoch: u64,
    value: T,
}

pub struct SealedCell<T> {
    seal: Arc<SealManager>,
    state_dir: Arc<StateDir>,
    file: &'static str,
    cache: RwLock<Option<Cached<T>>>,
}

impl<T> std::fmt::Debug for SealedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCell").field("file", &self.file).finish()
    }
}

impl<T> SealedCell<T>
where
    T: Default + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(seal: Arc<SealManager>, state_dir: Arc<StateDir>, file: &'static str) -> Self {
        Self { seal, state_dir, file, cache: RwLock::new(None) }
    }

    /// Shared view of the decrypted state. Fails with `Sealed` while sealed.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, T>> {
        let epoch = self.seal.barrier().await?.0;
        {
            let guard = self.cache.read().await;
            if guard.as_ref().is_some_and(|cached| cached.epoch == epoch) {
                return RwLockReadGuard::try_map(guard, |c| c.as_ref().map(|c| &c.value))
                    .map_err(|_| Error::Sealed);
            }
        }
        let mut guard = self.cache.write().await;
        self.load(&mut guard).await?;
        RwLockReadGuard::try_map(guard.downgrade(), |c| c.as_ref().map(|c| &c.value))
            .map_err(|_| Error::Sealed)
    }

    /// Apply `f` to a copy of the state and persist it. The change becomes
    /// visible only if both `f` and the write succeed. Updates are serialized.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.cache.write().await;
        self.load(&mut guard).await?;
        let cached = guard.as_mut().ok_or(Error::Sealed)?;

        let mut next = cached.value.clone();
        let result = f(&mut next)?;
        self.persist(&next).await?;
        cached.value = next;
        Ok(result)
    }

    /// Drop the decrypted copy from memory.
    pub async fn clear(&self) {
        *self.cache.write().await = None;
    }

    async fn persist(&self, value: &T) -> Result<()> {
        let (_, barrier) = self.seal.barrier().await?;
        let blob = barrier.seal_json(self.file, value)?;
        self.state_dir.write_json(self.file, &blob).await
    }

    async fn load(&self, guard: &mut RwLockWriteGuard<'_, Option<Cached<T>>>) -> Result<()> {
        let (epoch, barrier) = self.seal.barrier().await?;
        if guard.as_ref().is_some_and(|cached| cached.epoch == epoch) {
            return Ok(());
        }

        let value = match self.state_dir.read_json::<SealedBlob>(self.file).await? {
            Some(blob) => barrier.open_json(&blob)?,
            None => T::default(),
        };
        debug!(file = self.file, epoch, "decrypted sealed state");
        **guard = Some(Cached { epoch, value });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type Doc = BTreeMap<String, u32>;

    async fn setup(dir: &TempDir) -> (Arc<SealManager>, Arc<StateDir>, String) {
        let state_dir = Arc::new(StateDir::open(dir.path()).await.unwrap());
        let seal = Arc::new(SealManager::open(state_dir.clone()).await.unwrap());
        let init = seal.initialize(1, 1).await.unwrap();
        let share = init.shares[0].expose_secret().to_string();
        seal.unseal(&share).await;
        (seal, state_dir, share)
    }

    #[tokio::test]
    async fn test_update_persists_encrypted() {
        let dir = TempDir::new().unwrap();
        let (seal, state_dir, share) = setup(&dir).await;
        let cell: SealedCell<Doc> = SealedCell::new(seal.clone(), state_dir.clone(), "doc.sealed");

        cell.update(|doc| {
            doc.insert("serial".into(), 7);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(cell.read().await.unwrap().get("serial"), Some(&7));

        let raw = std::fs::read_to_string(dir.path().join("doc.sealed")).unwrap();
        assert!(!raw.contains("serial"));

        seal.seal().await.unwrap();
        assert!(matches!(cell.read().await, Err(Error::Sealed)));
        seal.unseal(&share).await;
        assert_eq!(cell.read().await.unwrap().get("serial"), Some(&7));
    }

    #[tokio::test]
    async fn test_failed_update_is_discarded() {
        let dir = TempDir::new().unwrap();
        let (seal, state_dir, _) = setup(&dir).await;
        let cell: SealedCell<Doc> = SealedCell::new(seal, state_dir, "doc.sealed");

        let result: Result<()> = cell
            .update(|doc| {
                doc.insert("partial".into(), 1);
                Err(Error::validation("rejected"))
            })
            .await;
        assert!(result.is_err());
        assert!(cell.read().await.unwrap().is_empty());
    }
}
