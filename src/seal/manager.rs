use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn, Instrument};
use zeroize::Zeroize;

use super::barrier::{Barrier, MasterKey, KEY_SIZE};
use super::keyfile::{KeyBackup, SealMetadata};
use super::shamir::{self, Share};
use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::secrets::SecretString;
use crate::storage::{StateDir, SEAL_FILE};

const CANARY_CONTEXT: &str = "seal-canary";
const CANARY_PLAINTEXT: &[u8] = b"vaultkeeper-seal-canary-v1";

/// Lifecycle state of the secret store's seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealState {
    Uninitialized,
    Sealed,
    /// Threshold reached; the master key is being reconstructed
    Unsealing,
    Unsealed,
}

impl SealState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealState::Uninitialized => "uninitialized",
            SealState::Sealed => "sealed",
            SealState::Unsealing => "unsealing",
            SealState::Unsealed => "unsealed",
        }
    }
}

impl std::fmt::Display for SealState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seal state plus unseal progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub state: SealState,
    pub threshold: u8,
    pub shares: u8,
    pub progress: u8,
}

/// Output of a successful [`SealManager::initialize`].
#[derive(Debug)]
pub struct Initialization {
    pub master_key: MasterKey,
    pub shares: Vec<SecretString>,
}

struct SealInner {
    metadata: Option<SealMetadata>,
    pending: Vec<Share>,
    barrier: Option<Barrier>,
}

/// Threshold seal manager.
///
/// Shares presented through [`SealManager::unseal`] are accumulated in memory
/// only; they are never written to disk. The accumulation runs under one mutex
/// so concurrent callers cannot race a reconstruction.
pub struct SealManager {
    state_dir: Arc<StateDir>,
    inner: Mutex<SealInner>,
    state_tx: watch::Sender<SealState>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager")
            .field("state", &*self.state_tx.borrow())
            .field("epoch", &self.epoch.load(Ordering::SeqCst))
            .finish()
    }
}

impl SealManager {
    /// Load seal metadata from the state directory. The store always starts
    /// sealed; the master key is never persisted.
    pub async fn open(state_dir: Arc<StateDir>) -> Result<Self> {
        let metadata: Option<SealMetadata> = state_dir.read_json(SEAL_FILE).await?;
        let state = if metadata.is_some() { SealState::Sealed } else { SealState::Uninitialized };

        if let Some(meta) = &metadata {
            info!(shares = meta.shares, threshold = meta.threshold, "loaded seal metadata");
        }

        let (state_tx, _) = watch::channel(state);
        Ok(Self {
            state_dir,
            inner: Mutex::new(SealInner { metadata, pending: Vec::new(), barrier: None }),
            state_tx,
            epoch: AtomicU64::new(0),
        })
    }

    /// Generate a master key, split it into `total_shares` shares with the given
    /// threshold, and persist the seal metadata. The store stays sealed.
    pub async fn initialize(&self, total_shares: u8, threshold: u8) -> Result<Initialization> {
        let span = crate::seal_span!("initialize");
        async move {
            let mut inner = self.inner.lock().await;
            if inner.metadata.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            if threshold == 0 || threshold > total_shares {
                return Err(Error::validation(format!(
                    "threshold must satisfy 1 <= threshold <= shares (got {} of {})",
                    threshold, total_shares
                )));
            }

            let master_key = MasterKey::generate()?;
            let shares = shamir::split(master_key.as_bytes(), threshold, total_shares, &mut OsRng)?;
            let canary = Barrier::new(master_key.clone()).encrypt(CANARY_CONTEXT, CANARY_PLAINTEXT)?;

            let metadata = SealMetadata {
                shares: total_shares,
                threshold,
                canary,
                initialized_at: Utc::now(),
                auto_unseal: false,
            };
            self.state_dir.write_json(SEAL_FILE, &metadata).await?;
            inner.metadata = Some(metadata);
            self.set_state(SealState::Sealed);

            warn!(
                shares = total_shares,
                threshold,
                "seal initialized: losing more than {} of {} unseal shares makes the store permanently unrecoverable",
                total_shares - threshold,
                total_shares
            );

            Ok(Initialization {
                master_key,
                shares: shares.iter().map(Share::encode).collect(),
            })
        }
        .instrument(span)
        .await
    }

    /// Present one unseal share.
    ///
    /// The state stays `Sealed` until the threshold is reached; partial
    /// progress is reported through [`SealStatus::progress`].
    ///
    /// Never fails: malformed, duplicate or out-of-range shares, shares presented
    /// while already unsealed, and calls on an uninitialized store are no-ops that
    /// return the current state. A complete share set that does not reconstruct
    /// the master key clears progress and returns `Sealed`.
    pub async fn unseal(&self, encoded_share: &str) -> SealState {
        let mut inner = self.inner.lock().await;
        let current = self.state();

        let Some(metadata) = inner.metadata.clone() else {
            return current;
        };
        if current == SealState::Unsealed {
            return current;
        }

        let share = match Share::decode(encoded_share) {
            Ok(share) => share,
            Err(e) => {
                debug!(error = %e, "ignoring malformed unseal share");
                metrics::record_unseal_share(false);
                return current;
            }
        };
        if share.index() > metadata.shares || share.len() != KEY_SIZE {
            debug!(index = share.index(), "ignoring share that does not belong to this seal");
            metrics::record_unseal_share(false);
            return current;
        }
        if inner.pending.iter().any(|s| s.index() == share.index()) {
            debug!(index = share.index(), "share already presented");
            return current;
        }

        inner.pending.push(share);
        metrics::record_unseal_share(true);

        if inner.pending.len() < metadata.threshold as usize {
            info!(
                progress = inner.pending.len(),
                threshold = metadata.threshold,
                "unseal share accepted"
            );
            return current;
        }

        let pending = std::mem::take(&mut inner.pending);
        self.set_state(SealState::Unsealing);
        match reconstruct(&pending, &metadata) {
            Ok(barrier) => {
                inner.barrier = Some(barrier);
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.set_state(SealState::Unsealed);
                info!(epoch, "secret store unsealed");
                SealState::Unsealed
            }
            Err(e) => {
                warn!(error = %e, "unseal shares did not reconstruct the master key; progress reset");
                self.set_state(SealState::Sealed);
                SealState::Sealed
            }
        }
    }

    /// Forced reseal: drops the master key and any accumulated shares.
    pub async fn seal(&self) -> Result<SealState> {
        let mut inner = self.inner.lock().await;
        if inner.metadata.is_none() {
            return Err(Error::NotInitialized);
        }
        inner.barrier = None;
        inner.pending.clear();
        self.set_state(SealState::Sealed);
        info!("secret store sealed");
        Ok(SealState::Sealed)
    }

    pub fn state(&self) -> SealState {
        *self.state_tx.borrow()
    }

    pub async fn status(&self) -> SealStatus {
        let inner = self.inner.lock().await;
        let (threshold, shares) =
            inner.metadata.as_ref().map(|m| (m.threshold, m.shares)).unwrap_or((0, 0));
        SealStatus { state: self.state(), threshold, shares, progress: inner.pending.len() as u8 }
    }

    pub fn is_unsealed(&self) -> bool {
        self.state() == SealState::Unsealed
    }

    /// Number of completed unseals in this process. State derived from the
    /// master key is reloaded whenever this changes.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The encryption barrier, available only while unsealed.
    pub async fn barrier(&self) -> Result<(u64, Barrier)> {
        let inner = self.inner.lock().await;
        match &inner.barrier {
            Some(barrier) => Ok((self.epoch(), barrier.clone())),
            None => Err(Error::Sealed),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SealState> {
        self.state_tx.subscribe()
    }

    /// Poll the seal status every `poll_interval` until the store is unsealed or
    /// `timeout` expires.
    pub async fn wait_until_unsealed(&self, timeout: Duration, poll_interval: Duration) -> Result<()> {
        let poll = async {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if self.is_unsealed() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::timeout("waiting for unseal", timeout.as_millis() as u64))
    }

    /// Record the configured auto-unseal policy in the seal metadata.
    pub async fn record_auto_unseal_policy(&self, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(metadata) = inner.metadata.as_mut() else {
            return Ok(());
        };
        if metadata.auto_unseal != enabled {
            metadata.auto_unseal = enabled;
            let snapshot = metadata.clone();
            self.state_dir.write_json(SEAL_FILE, &snapshot).await?;
        }
        Ok(())
    }

    /// Unseal from a locally cached key backup.
    pub async fn auto_unseal(&self, backup: &KeyBackup) -> SealState {
        let span = crate::seal_span!("auto_unseal");
        async move {
            let mut state = self.state();
            for share in backup.share_secrets() {
                state = self.unseal(share.expose_secret()).await;
                if state == SealState::Unsealed {
                    break;
                }
            }
            if state != SealState::Unsealed {
                warn!(state = %state, "auto-unseal did not complete from cached shares");
            }
            state
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, state: SealState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            metrics::record_seal_transition(state.as_str());
        }
    }
}

fn reconstruct(shares: &[Share], metadata: &SealMetadata) -> Result<Barrier> {
    let mut bytes = shamir::combine(shares)?;
    let key = MasterKey::from_slice(&bytes);
    bytes.zeroize();
    let barrier = Barrier::new(key?);

    let canary = barrier.decrypt(&metadata.canary)?;
    if canary != CANARY_PLAINTEXT {
        return Err(Error::crypto("seal canary mismatch"));
    }
    Ok(barrier)
}
