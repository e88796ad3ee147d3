//! Wiring of every component into one shared service instance.
//!
//! [`Orchestrator`] owns the seal manager, secret store, CA, token store, audit
//! log, startup coordinator and rotation scheduler. The daemon and the HTTP API
//! both hold it behind an `Arc`; it also acts as the in-process
//! [`CredentialSource`] for the broker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::audit::{AuditEntry, AuditLog, SYSTEM_ACTOR};
use crate::auth::TokenStore;
use crate::broker::{CredentialBroker, CredentialSource};
use crate::config::AppConfig;
use crate::errors::{Error, Result};
use crate::pki::{CertificateAuthority, TlsBundle};
use crate::rotation::{Alert, RotationPolicy, RotationScheduler, TrackedItem};
use crate::seal::{KeyBackup, SealManager, SealState, SealStatus};
use crate::secrets::{generate_password, CredentialRecord, SecretStore, SecretString};
use crate::startup::probe::FnProbe;
use crate::startup::{NodeSnapshot, ServiceManifest, StartupCoordinator, ORCHESTRATOR_NODE};
use crate::storage::{StateDir, KEYS_FILE};

/// Secrets returned exactly once by [`Orchestrator::initialize`].
#[derive(Debug)]
pub struct InitOutput {
    pub shares: Vec<SecretString>,
    pub admin_token: SecretString,
    pub threshold: u8,
}

/// What [`Orchestrator::bootstrap_services`] created.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub credentials_created: Vec<String>,
    pub pki_bootstrapped: bool,
    pub roles_defined: Vec<String>,
    pub certificates_issued: Vec<String>,
}

/// Administrative status view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub seal: SealStatus,
    pub pki_bootstrapped: bool,
    pub services: Vec<NodeSnapshot>,
    pub rotation: Vec<TrackedItem>,
    pub alerts: Vec<Alert>,
}

pub struct Orchestrator {
    config: AppConfig,
    state_dir: Arc<StateDir>,
    manifest: ServiceManifest,
    seal: Arc<SealManager>,
    store: Arc<SecretStore>,
    ca: Arc<CertificateAuthority>,
    tokens: Arc<TokenStore>,
    audit: AuditLog,
    coordinator: Arc<StartupCoordinator>,
    scheduler: Arc<RotationScheduler>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_dir", &self.state_dir.root())
            .field("services", &self.manifest.services.len())
            .field("seal_state", &self.seal.state())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Open the state directory and load the manifest named in the config.
    pub async fn from_config(config: AppConfig) -> Result<Arc<Self>> {
        let manifest = match &config.startup.manifest_path {
            Some(path) => ServiceManifest::load(path)?,
            None => {
                warn!("no service manifest configured; only the orchestrator node will be coordinated");
                ServiceManifest::default()
            }
        };
        Self::new(config, manifest).await
    }

    pub async fn new(config: AppConfig, manifest: ServiceManifest) -> Result<Arc<Self>> {
        manifest.validate()?;
        let state_dir = Arc::new(StateDir::open(&config.storage.data_dir).await?);
        let seal = Arc::new(SealManager::open(state_dir.clone()).await?);
        let store = Arc::new(SecretStore::new(seal.clone(), state_dir.clone()));
        let ca = Arc::new(CertificateAuthority::new(seal.clone(), state_dir.clone()));
        let tokens = Arc::new(TokenStore::open(state_dir.clone()).await?);
        let audit = AuditLog::new(state_dir.clone());

        let seal_probe = {
            let seal = seal.clone();
            Arc::new(FnProbe::new("seal-state", move || {
                let seal = seal.clone();
                async move { seal.is_unsealed() }
            }))
        };
        let coordinator = Arc::new(StartupCoordinator::from_manifest(
            &manifest,
            seal_probe,
            config.startup.probe_timeout(),
            config.startup.probe_interval(),
        )?);

        let scheduler = Arc::new(RotationScheduler::new(
            store.clone(),
            ca.clone(),
            coordinator.clone(),
            RotationPolicy::from(&config.rotation),
            config.rotation.restart_timeout(),
            config.rotation.max_alerts,
        ));

        Ok(Arc::new(Self {
            config,
            state_dir,
            manifest,
            seal,
            store,
            ca,
            tokens,
            audit,
            coordinator,
            scheduler,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn manifest(&self) -> &ServiceManifest {
        &self.manifest
    }

    pub fn seal_manager(&self) -> &Arc<SealManager> {
        &self.seal
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn coordinator(&self) -> &Arc<StartupCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<RotationScheduler> {
        &self.scheduler
    }

    /// Broker that reads straight from this instance.
    pub fn broker(self: &Arc<Self>) -> CredentialBroker {
        let source: Arc<dyn CredentialSource> = self.clone();
        CredentialBroker::new(source, self.config.broker.retry_policy())
    }

    /// Initialize the seal and create the admin token. The unseal-key backup
    /// (every share plus the plaintext admin token) is written to `keys.json`;
    /// the store stays sealed.
    #[instrument(skip(self))]
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<InitOutput> {
        let result = self.initialize_inner(shares, threshold).await;
        self.audit
            .record(
                AuditEntry::new("seal.initialize", "seal", SYSTEM_ACTOR)
                    .with_detail(format!("shares={} threshold={}", shares, threshold))
                    .outcome(&result),
            )
            .await;
        result
    }

    async fn initialize_inner(&self, shares: u8, threshold: u8) -> Result<InitOutput> {
        let init = self.seal.initialize(shares, threshold).await?;
        let admin_token = self.tokens.create_admin_token().await?;

        let backup = KeyBackup::new(&init.shares, &admin_token, threshold);
        let key_file = self.state_dir.path(KEYS_FILE);
        backup.save(&key_file).await?;
        self.seal.record_auto_unseal_policy(self.config.seal.auto_unseal).await?;
        if !self.config.seal.auto_unseal {
            warn!(
                key_file = %key_file.display(),
                "key backup holds every unseal share and the admin token; auto-unseal is off, move it off this host"
            );
        }

        Ok(InitOutput { shares: init.shares, admin_token, threshold })
    }

    /// Present one share. Reaching `Unsealed` triggers service bootstrap.
    pub async fn unseal(&self, share: &str) -> SealStatus {
        let before = self.seal.state();
        let state = self.seal.unseal(share).await;
        if state == SealState::Unsealed && before != SealState::Unsealed {
            self.audit.record(AuditEntry::new("seal.unseal", "seal", SYSTEM_ACTOR)).await;
            self.bootstrap_after_unseal().await;
        }
        self.seal.status().await
    }

    /// Forced reseal; decrypted state is dropped from memory.
    pub async fn seal(&self, actor: &str) -> Result<SealState> {
        let result = self.seal.seal().await;
        if result.is_ok() {
            self.store.clear().await;
            self.ca.clear().await;
        }
        self.audit.record(AuditEntry::new("seal.seal", "seal", actor).outcome(&result)).await;
        result
    }

    /// Record the configured auto-unseal policy and, when enabled, unseal from
    /// the local key backup.
    #[instrument(skip(self))]
    pub async fn auto_unseal(&self) -> Result<SealState> {
        let enabled = self.config.seal.auto_unseal;
        if self.seal.state() == SealState::Uninitialized {
            return Ok(SealState::Uninitialized);
        }
        self.seal.record_auto_unseal_policy(enabled).await?;
        self.audit
            .record(
                AuditEntry::new("seal.auto_unseal_policy", "seal", SYSTEM_ACTOR)
                    .with_detail(format!("enabled={}", enabled)),
            )
            .await;
        if !enabled {
            info!("auto-unseal disabled; waiting for unseal shares");
            return Ok(self.seal.state());
        }

        let Some(backup) = KeyBackup::load(&self.state_dir.path(KEYS_FILE)).await? else {
            warn!("auto-unseal enabled but no key backup found");
            return Ok(self.seal.state());
        };
        let state = self.seal.auto_unseal(&backup).await;
        let entry = AuditEntry::new("seal.auto_unseal", "seal", SYSTEM_ACTOR);
        if state == SealState::Unsealed {
            self.audit.record(entry).await;
            self.bootstrap_after_unseal().await;
        } else {
            self.audit.record(entry.failed(format!("state={}", state))).await;
        }
        Ok(state)
    }

    async fn bootstrap_after_unseal(&self) {
        match self.bootstrap_services().await {
            Ok(summary) => info!(
                credentials = summary.credentials_created.len(),
                certificates = summary.certificates_issued.len(),
                pki_bootstrapped = summary.pki_bootstrapped,
                "service bootstrap complete"
            ),
            Err(err) => warn!(error = %err, "service bootstrap failed"),
        }
    }

    /// Create missing credential records, the CA hierarchy, roles and first
    /// leaves for every manifest service. Existing state is left untouched.
    #[instrument(skip(self))]
    pub async fn bootstrap_services(&self) -> Result<BootstrapSummary> {
        let mut summary = BootstrapSummary::default();
        let pki = &self.config.pki;

        for service in &self.manifest.services {
            let mut template = CredentialRecord::new(&service.id, service.username(), generate_password())
                .with_tls(service.tls);
            template.extra_fields = service.extra_fields.clone();
            if self.store.ensure_record(&service.id, template).await?.is_some() {
                summary.credentials_created.push(service.id.clone());
            }
        }

        let tls_services: Vec<_> = self.manifest.services.iter().filter(|s| s.tls).collect();
        if tls_services.is_empty() {
            return Ok(summary);
        }

        if !self.ca.is_bootstrapped().await? {
            self.ca.bootstrap(pki.root_validity(), pki.intermediate_validity()).await?;
            summary.pki_bootstrapped = true;
        }

        for service in tls_services {
            if matches!(self.ca.role(&service.id).await, Err(Error::NotFound { .. })) {
                self.ca
                    .define_role(&service.id, service.role_names(), pki.default_leaf_ttl(), pki.default_key_size)
                    .await?;
                summary.roles_defined.push(service.id.clone());
            }
            if self.ca.active_leaf(&service.id).await?.is_none() {
                let role = self.ca.role(&service.id).await?;
                let names = role.allowed_common_names.iter().filter(|n| !n.starts_with("*.")).cloned().collect();
                self.ca.issue(&service.id, role.max_ttl, names).await?;
                summary.certificates_issued.push(service.id.clone());
            }
        }

        if summary != BootstrapSummary::default() {
            self.audit
                .record(AuditEntry::new("services.bootstrap", "manifest", SYSTEM_ACTOR).with_detail(format!(
                    "credentials={} certificates={}",
                    summary.credentials_created.len(),
                    summary.certificates_issued.len()
                )))
                .await;
        }
        Ok(summary)
    }

    pub async fn status(&self) -> Result<OrchestratorStatus> {
        let seal = self.seal.status().await;
        let pki_bootstrapped = match self.ca.is_bootstrapped().await {
            Ok(done) => done,
            Err(Error::Sealed) => false,
            Err(err) => return Err(err),
        };
        Ok(OrchestratorStatus {
            seal,
            pki_bootstrapped,
            services: self.coordinator.snapshot(),
            rotation: self.scheduler.items().await,
            alerts: self.scheduler.alerts().await,
        })
    }

    /// Ids of every coordinated node except the orchestrator itself.
    pub fn service_ids(&self) -> Vec<String> {
        self.coordinator.graph().order().iter().filter(|id| id.as_str() != ORCHESTRATOR_NODE).cloned().collect()
    }
}

#[async_trait]
impl CredentialSource for Orchestrator {
    async fn credentials(&self, service_id: &str) -> Result<CredentialRecord> {
        self.store.get(service_id, None).await
    }

    async fn current_version(&self, service_id: &str) -> Result<u64> {
        self.store.current_version(service_id).await
    }

    async fn tls_material(&self, service_id: &str) -> Result<TlsBundle> {
        let record = self.store.get(service_id, None).await?;
        if !record.tls_enabled {
            return Err(Error::NotConfigured { service_id: service_id.to_string() });
        }
        self.ca.export_chain(service_id).await
    }
}
