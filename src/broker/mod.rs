//! # Credential Broker
//!
//! The contract a dependent service's startup hook uses to obtain its
//! credential record and TLS material. The broker holds no state of its own:
//! it wraps a [`CredentialSource`] (the in-process orchestrator or the HTTP
//! client) in the bounded retry discipline of [`RetryPolicy`], so a service
//! that starts while the store is still sealed waits instead of failing.
//!
//! Fetches are reads only. Retrying them never writes a version.

pub mod remote;
pub mod retry;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::pki::TlsBundle;
use crate::secrets::CredentialRecord;

pub use retry::RetryPolicy;

/// Where credential reads are served from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Latest fetchable credential record for the service
    async fn credentials(&self, service_id: &str) -> Result<CredentialRecord>;

    /// Latest version number, used by caches to detect staleness
    async fn current_version(&self, service_id: &str) -> Result<u64>;

    /// Active leaf, key and CA chain. Fails with `NotConfigured` when the
    /// service's record has TLS disabled.
    async fn tls_material(&self, service_id: &str) -> Result<TlsBundle>;
}

/// Outcome of a TLS fetch. TLS is opt-in per service, so the absence of
/// material is a normal branch rather than an error.
#[derive(Debug, Clone)]
pub enum TlsFetch {
    Configured(TlsBundle),
    NotConfigured,
}

impl TlsFetch {
    pub fn bundle(&self) -> Option<&TlsBundle> {
        match self {
            TlsFetch::Configured(bundle) => Some(bundle),
            TlsFetch::NotConfigured => None,
        }
    }
}

#[derive(Clone)]
pub struct CredentialBroker {
    source: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker").field("retry", &self.retry).finish_non_exhaustive()
    }
}

impl CredentialBroker {
    pub fn new(source: Arc<dyn CredentialSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch the service's credential record, retrying transient failures
    /// (`Sealed`, transport errors) until the deadline.
    pub async fn fetch_credentials(&self, service_id: &str) -> Result<CredentialRecord> {
        let started = Instant::now();
        let result = self.retry.run("fetch_credentials", || self.source.credentials(service_id)).await;
        metrics::record_broker_fetch(
            service_id,
            "credentials",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match &result {
            Ok(record) => debug!(service_id, version = record.version, "credentials fetched"),
            Err(e) => warn!(service_id, error = %e, "credential fetch failed"),
        }
        result
    }

    /// Fetch TLS material for the service. `NotConfigured` is mapped to
    /// [`TlsFetch::NotConfigured`].
    pub async fn fetch_tls_material(&self, service_id: &str) -> Result<TlsFetch> {
        let started = Instant::now();
        let result = self.retry.run("fetch_tls_material", || self.source.tls_material(service_id)).await;
        let result = match result {
            Ok(bundle) => Ok(TlsFetch::Configured(bundle)),
            Err(Error::NotConfigured { .. }) => {
                info!(service_id, "TLS not enabled for service");
                Ok(TlsFetch::NotConfigured)
            }
            Err(e) => Err(e),
        };
        metrics::record_broker_fetch(service_id, "tls", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    pub async fn current_version(&self, service_id: &str) -> Result<u64> {
        self.retry.run("current_version", || self.source.current_version(service_id)).await
    }
}

/// Holds the last credential record a consumer received and re-fetches only
/// when the source reports a newer version.
#[derive(Debug)]
pub struct CredentialCache {
    broker: CredentialBroker,
    service_id: String,
    cached: Mutex<Option<CredentialRecord>>,
}

impl CredentialCache {
    pub fn new(broker: CredentialBroker, service_id: impl Into<String>) -> Self {
        Self { broker, service_id: service_id.into(), cached: Mutex::new(None) }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Current record. A failed staleness check keeps serving the cached copy;
    /// it was valid when fetched and old versions stay fetchable until retired.
    pub async fn get(&self) -> Result<CredentialRecord> {
        let mut cached = self.cached.lock().await;

        if let Some(record) = cached.as_ref() {
            match self.broker.source.current_version(&self.service_id).await {
                Ok(latest) if latest <= record.version => return Ok(record.clone()),
                Ok(latest) => {
                    debug!(service_id = %self.service_id, cached = record.version, latest, "cache stale");
                }
                Err(e) if e.is_retryable() => {
                    warn!(service_id = %self.service_id, error = %e, "version check failed, serving cached record");
                    return Ok(record.clone());
                }
                Err(e) => return Err(e),
            }
        }

        let record = self.broker.fetch_credentials(&self.service_id).await?;
        *cached = Some(record.clone());
        Ok(record)
    }

    /// Version currently held, if any
    pub async fn cached_version(&self) -> Option<u64> {
        self.cached.lock().await.as_ref().map(|r| r.version)
    }

    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}
