use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::policy::{Alert, AlertSeverity, ItemKind, RotationPolicy, RotationState};
use crate::errors::{Error, Result};
use crate::observability::metrics;
use crate::pki::CertificateAuthority;
use crate::secrets::{generate_password, SecretStore};
use crate::startup::StartupCoordinator;

/// One credential or certificate under rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    pub service_id: String,
    pub kind: ItemKind,
    pub state: RotationState,
    /// Password nominal expiry or certificate not_after; `None` when nothing valid exists
    pub expires_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip)]
    warned: bool,
}

impl TrackedItem {
    fn new(service_id: &str, kind: ItemKind) -> Self {
        Self {
            service_id: service_id.to_string(),
            kind,
            state: RotationState::Fresh,
            expires_at: None,
            last_evaluated_at: None,
            last_rotated_at: None,
            last_error: None,
            warned: false,
        }
    }
}

/// What one service's rotation produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRotation {
    pub service_id: String,
    pub kinds: Vec<ItemKind>,
    pub new_version: Option<u64>,
    pub new_serial: Option<u64>,
    /// Services restarted, in the order they were restarted
    pub restarted: Vec<String>,
    pub retired_versions: Vec<u64>,
    pub retired_serials: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub evaluated: usize,
    pub rotated: Vec<ServiceRotation>,
    /// Service id to failure message
    pub failed: BTreeMap<String, String>,
    pub alerts_raised: usize,
    /// True when the cycle was skipped because the store is sealed
    pub skipped: bool,
}

type ItemKey = (String, ItemKind);

/// Periodically evaluates credential and certificate age and rolls out
/// replacements: write the new version, restart the affected services in
/// dependency order, and retire the prior version only after they report
/// healthy.
pub struct RotationScheduler {
    store: Arc<SecretStore>,
    ca: Arc<CertificateAuthority>,
    coordinator: Arc<StartupCoordinator>,
    policy: RotationPolicy,
    restart_timeout: Duration,
    max_alerts: usize,
    items: Mutex<BTreeMap<ItemKey, TrackedItem>>,
    alerts: Mutex<VecDeque<Alert>>,
    cycle_lock: Mutex<()>,
}

impl std::fmt::Debug for RotationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationScheduler")
            .field("policy", &self.policy)
            .field("restart_timeout", &self.restart_timeout)
            .finish_non_exhaustive()
    }
}

impl RotationScheduler {
    pub fn new(
        store: Arc<SecretStore>,
        ca: Arc<CertificateAuthority>,
        coordinator: Arc<StartupCoordinator>,
        policy: RotationPolicy,
        restart_timeout: Duration,
        max_alerts: usize,
    ) -> Self {
        Self {
            store,
            ca,
            coordinator,
            policy,
            restart_timeout,
            max_alerts: max_alerts.max(1),
            items: Mutex::new(BTreeMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Evaluate on `interval` until cancelled. The first cycle runs after one
    /// full interval.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "rotation scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rotation scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.skipped => debug!("rotation cycle skipped while sealed"),
                        Ok(report) => info!(
                            evaluated = report.evaluated,
                            rotated = report.rotated.len(),
                            failed = report.failed.len(),
                            "rotation cycle complete"
                        ),
                        Err(e) => error!(error = %e, "rotation cycle failed"),
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Evaluate every tracked item as of `now` and roll out the due ones.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let mut report = CycleReport::default();

        let due = match self.evaluate(now, &mut report).await {
            Ok(due) => due,
            Err(Error::Sealed) => {
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        for (service_id, kinds) in self.in_restart_order(due) {
            match self.rotate_service(&service_id, &kinds, now).await {
                Ok(rotation) => report.rotated.push(rotation),
                Err(e) => {
                    report.failed.insert(service_id, e.to_string());
                    report.alerts_raised += 1;
                }
            }
        }
        Ok(report)
    }

    /// Rotate everything rotatable for `service_id` right now, regardless of age.
    pub async fn force_rotate(&self, service_id: &str) -> Result<ServiceRotation> {
        let _cycle = self.cycle_lock.lock().await;
        let kinds = self.rotatable_kinds(service_id).await?;
        if kinds.is_empty() {
            return Err(Error::not_found("rotatable item", service_id));
        }
        info!(service_id, kinds = ?kinds, "forced rotation requested");
        self.rotate_service(service_id, &kinds, Utc::now()).await
    }

    pub async fn items(&self) -> Vec<TrackedItem> {
        self.items.lock().await.values().cloned().collect()
    }

    pub async fn item(&self, service_id: &str, kind: ItemKind) -> Option<TrackedItem> {
        self.items.lock().await.get(&(service_id.to_string(), kind)).cloned()
    }

    /// Most recent alerts, oldest first
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.iter().cloned().collect()
    }

    /// Refresh every item's expiry, raise threshold alerts, and return the due
    /// items grouped by service.
    async fn evaluate(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<BTreeMap<String, BTreeSet<ItemKind>>> {
        let observed = self.observe().await?;
        let mut due: BTreeMap<String, BTreeSet<ItemKind>> = BTreeMap::new();
        let mut alerts = Vec::new();

        {
            let mut items = self.items.lock().await;
            for ((service_id, kind), expires_at) in observed {
                let item = items
                    .entry((service_id.clone(), kind))
                    .or_insert_with(|| TrackedItem::new(&service_id, kind));
                item.expires_at = expires_at;
                item.last_evaluated_at = Some(now);

                let assessment = self.policy.assess(expires_at, now);
                if assessment.due {
                    item.state = RotationState::Due;
                    due.entry(service_id.clone()).or_default().insert(kind);
                } else if item.state != RotationState::Due {
                    item.state = RotationState::Fresh;
                }

                if let Some(severity) = assessment.alert {
                    if !item.warned || severity == AlertSeverity::Critical {
                        item.warned = true;
                        let message = match expires_at {
                            Some(at) => format!("{} for '{}' expires at {}", kind, service_id, at),
                            None => format!("no valid {} in place for '{}'", kind, service_id),
                        };
                        alerts.push((severity, service_id.clone(), kind, message));
                    }
                }
                report.evaluated += 1;
            }
        }

        for (severity, service_id, kind, message) in alerts {
            self.raise(severity, &service_id, kind, message).await;
            report.alerts_raised += 1;
        }
        Ok(due)
    }

    /// Current expiry of every item that can be rotated.
    async fn observe(&self) -> Result<Vec<(ItemKey, Option<DateTime<Utc>>)>> {
        let mut observed = Vec::new();
        let ca_ready = self.ca.is_bootstrapped().await?;

        for path in self.store.list("").await? {
            let created_at = self.store.versions(&path).await?.last().map(|v| v.created_at);
            observed.push(((path.clone(), ItemKind::Credential), created_at.map(|c| self.policy.password_expiry(c))));

            if ca_ready && self.wants_certificate(&path).await? {
                let expires_at = self.ca.active_leaf(&path).await?.map(|leaf| leaf.not_after);
                observed.push(((path, ItemKind::Certificate), expires_at));
            }
        }
        Ok(observed)
    }

    /// TLS enabled on the latest record and a role to issue under.
    async fn wants_certificate(&self, service_id: &str) -> Result<bool> {
        let record = self.store.get(service_id, None).await?;
        if !record.tls_enabled {
            return Ok(false);
        }
        match self.ca.role(service_id).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rotatable_kinds(&self, service_id: &str) -> Result<Vec<ItemKind>> {
        let mut kinds = Vec::new();
        match self.store.current_version(service_id).await {
            Ok(_) => kinds.push(ItemKind::Credential),
            Err(Error::NotFound { .. }) => return Ok(kinds),
            Err(e) => return Err(e),
        }
        if self.ca.is_bootstrapped().await? && self.wants_certificate(service_id).await? {
            kinds.push(ItemKind::Certificate);
        }
        Ok(kinds)
    }

    /// Managed services in dependency order first, then the rest by name.
    fn in_restart_order(&self, mut due: BTreeMap<String, BTreeSet<ItemKind>>) -> Vec<(String, Vec<ItemKind>)> {
        let mut ordered = Vec::with_capacity(due.len());
        for id in self.coordinator.graph().order() {
            if let Some(kinds) = due.remove(id) {
                ordered.push((id.clone(), kinds.into_iter().collect()));
            }
        }
        ordered.extend(due.into_iter().map(|(id, kinds)| (id, kinds.into_iter().collect())));
        ordered
    }

    async fn rotate_service(&self, service_id: &str, kinds: &[ItemKind], now: DateTime<Utc>) -> Result<ServiceRotation> {
        let span = crate::rotation_span!(service_id, kinds = ?kinds);
        async move {
            self.set_state(service_id, kinds, RotationState::Rotating, None).await;

            let result = self.roll_out(service_id, kinds).await;
            match result {
                Ok(rotation) => {
                    let mut items = self.items.lock().await;
                    for kind in kinds {
                        if let Some(item) = items.get_mut(&(service_id.to_string(), *kind)) {
                            item.state = RotationState::RolledOut;
                            item.last_rotated_at = Some(now);
                            item.last_error = None;
                            item.warned = false;
                        }
                        metrics::record_rotation(service_id, &kind.to_string(), "rolled_out");
                    }
                    drop(items);
                    self.coordinator.set_credentials_degraded(service_id, false);
                    info!(
                        restarted = ?rotation.restarted,
                        retired_versions = ?rotation.retired_versions,
                        retired_serials = ?rotation.retired_serials,
                        "rotation rolled out"
                    );
                    Ok(rotation)
                }
                Err(e) => {
                    let outcome = if matches!(e, Error::RotationTimeout { .. }) { "timeout" } else { "error" };
                    self.set_state(service_id, kinds, RotationState::Due, Some(e.to_string())).await;
                    for kind in kinds {
                        metrics::record_rotation(service_id, &kind.to_string(), outcome);
                    }
                    if matches!(e, Error::RotationTimeout { .. }) {
                        self.coordinator.set_credentials_degraded(service_id, true);
                    }
                    let kind = kinds.first().copied().unwrap_or(ItemKind::Credential);
                    self.raise(
                        AlertSeverity::Critical,
                        service_id,
                        kind,
                        format!("rotation failed, prior version retained: {}", e),
                    )
                    .await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Due → Rotating → RolledOut. Nothing is retired unless every restarted
    /// service reported healthy.
    async fn roll_out(&self, service_id: &str, kinds: &[ItemKind]) -> Result<ServiceRotation> {
        let mut rotation =
            ServiceRotation { service_id: service_id.to_string(), kinds: kinds.to_vec(), ..Default::default() };

        if kinds.contains(&ItemKind::Credential) {
            let current = self.store.get(service_id, None).await?;
            let expected = current.version;
            let version = self
                .store
                .put_if_version(service_id, current.with_password(generate_password()), expected)
                .await?;
            rotation.new_version = Some(version);
        }
        if kinds.contains(&ItemKind::Certificate) {
            rotation.new_serial = Some(self.ca.renew(service_id).await?.serial_number);
        }

        if self.coordinator.contains(service_id) {
            rotation.restarted = self
                .coordinator
                .restart(&[service_id.to_string()], "credentials rotated", self.restart_timeout)
                .await?;
        } else {
            debug!("service not managed by the coordinator, no restart required");
        }

        if let Some(version) = rotation.new_version {
            rotation.retired_versions = self.store.retire_before(service_id, version).await?;
        }
        if rotation.new_serial.is_some() {
            rotation.retired_serials = self.ca.confirm_reload(service_id).await?;
        }
        Ok(rotation)
    }

    async fn set_state(&self, service_id: &str, kinds: &[ItemKind], state: RotationState, error: Option<String>) {
        let mut items = self.items.lock().await;
        for kind in kinds {
            let item = items
                .entry((service_id.to_string(), *kind))
                .or_insert_with(|| TrackedItem::new(service_id, *kind));
            item.state = state;
            if error.is_some() {
                item.last_error = error.clone();
            }
        }
    }

    async fn raise(&self, severity: AlertSeverity, service_id: &str, kind: ItemKind, message: String) {
        match severity {
            AlertSeverity::Warning => {
                warn!(alert.severity = severity.as_str(), service_id, kind = %kind, "{}", message)
            }
            AlertSeverity::Critical => {
                error!(alert.severity = severity.as_str(), service_id, kind = %kind, "{}", message)
            }
        }
        metrics::record_alert(severity.as_str());

        let mut alerts = self.alerts.lock().await;
        if alerts.len() >= self.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            raised_at: Utc::now(),
            severity,
            service_id: service_id.to_string(),
            kind,
            message,
        });
    }
}
