use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::graph::DependencyGraph;
use super::manifest::ServiceManifest;
use super::probe::{probe_until_healthy, HealthProbe};
use super::ORCHESTRATOR_NODE;
use crate::errors::{Error, Result};
use crate::observability::metrics;

/// Lifecycle of one startup node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Starting,
    Ready,
    Failed(String),
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Starting => "starting",
            NodeState::Ready => "ready",
            NodeState::Failed(_) => "failed",
        }
    }

    /// True once the node's launch has been released
    pub fn is_released(&self) -> bool {
        matches!(self, NodeState::Starting | NodeState::Ready)
    }
}

/// Operator-facing status. Each variant is reported distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    NotStarted,
    WaitingOnDependency,
    Starting,
    Healthy,
    Failed,
    /// A rotation failed; the service still runs on the prior credential
    CredentialsDegraded,
}

/// Input to the coordinator: one node and how to probe it.
#[derive(Clone)]
pub struct NodeDefinition {
    pub service_id: String,
    pub depends_on: Vec<String>,
    pub probe: Arc<dyn HealthProbe>,
    /// Restarts are carried out by a supervisor, which must acknowledge them
    pub supervised: bool,
}

impl NodeDefinition {
    pub fn new(service_id: impl Into<String>, depends_on: Vec<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self { service_id: service_id.into(), depends_on, probe, supervised: false }
    }

    pub fn supervised(mut self, supervised: bool) -> Self {
        self.supervised = supervised;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeRecord {
    state: NodeState,
    credentials_degraded: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub service_id: String,
    pub depends_on: Vec<String>,
    pub state: NodeState,
    pub status: ServiceStatus,
    pub credentials_degraded: bool,
    pub updated_at: DateTime<Utc>,
}

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

/// Completion handle for a [`RestartRequest`]. Only the first report counts.
#[derive(Debug, Clone)]
pub struct RestartAck(Arc<StdMutex<Option<AckSender>>>);

impl RestartAck {
    /// Report that the restart finished (`Ok`) or could not be carried out.
    pub fn complete(&self, outcome: std::result::Result<(), String>) {
        let sender = self.0.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

/// Restart request broadcast to supervisors.
#[derive(Debug, Clone)]
pub struct RestartRequest {
    pub service_id: String,
    pub reason: String,
    pub ack: RestartAck,
}

impl RestartRequest {
    fn new(
        service_id: &str,
        reason: &str,
    ) -> (Self, oneshot::Receiver<std::result::Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            service_id: service_id.to_string(),
            reason: reason.to_string(),
            ack: RestartAck(Arc::new(StdMutex::new(Some(tx)))),
        };
        (request, rx)
    }
}

/// Outcome of one startup pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupReport {
    pub ready: Vec<String>,
    pub failed: BTreeMap<String, String>,
    /// Pending nodes and the failed ancestors that block them
    pub blocked: BTreeMap<String, Vec<String>>,
    pub cancelled: bool,
}

impl StartupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && !self.cancelled
    }

    /// `DependencyFailed` for every blocked node
    pub fn dependency_errors(&self) -> Vec<Error> {
        self.blocked
            .iter()
            .map(|(service_id, failed)| Error::DependencyFailed {
                service_id: service_id.clone(),
                failed: failed.clone(),
            })
            .collect()
    }
}

/// Launches nodes in dependency order, concurrently across independent
/// branches, and tracks each node's state for gates and status queries.
pub struct StartupCoordinator {
    graph: DependencyGraph,
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    supervised: BTreeSet<String>,
    nodes: watch::Sender<BTreeMap<String, NodeRecord>>,
    running: AtomicBool,
    probe_timeout: Duration,
    probe_interval: Duration,
    restarts: broadcast::Sender<RestartRequest>,
    restart_lock: Mutex<()>,
}

impl std::fmt::Debug for StartupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupCoordinator")
            .field("nodes", &self.graph.order())
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl StartupCoordinator {
    pub fn new(
        definitions: Vec<NodeDefinition>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Result<Self> {
        let graph = DependencyGraph::new(
            definitions.iter().map(|d| (d.service_id.clone(), d.depends_on.clone())),
        )?;

        let now = Utc::now();
        let records = definitions
            .iter()
            .map(|d| {
                let record = NodeRecord { state: NodeState::Pending, credentials_degraded: false, updated_at: now };
                (d.service_id.clone(), record)
            })
            .collect();
        let supervised = definitions.iter().filter(|d| d.supervised).map(|d| d.service_id.clone()).collect();
        let probes = definitions.into_iter().map(|d| (d.service_id, d.probe)).collect();
        let (restarts, _) = broadcast::channel(64);

        Ok(Self {
            graph,
            probes,
            supervised,
            nodes: watch::Sender::new(records),
            running: AtomicBool::new(false),
            probe_timeout,
            probe_interval,
            restarts,
            restart_lock: Mutex::new(()),
        })
    }

    /// Build from a manifest. The orchestrator itself becomes a root node
    /// probed by `seal_probe`, and every manifest service depends on it.
    /// Services with a `restart_command` are supervised.
    pub fn from_manifest(
        manifest: &ServiceManifest,
        seal_probe: Arc<dyn HealthProbe>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Result<Self> {
        let mut definitions = vec![NodeDefinition::new(ORCHESTRATOR_NODE, Vec::new(), seal_probe)];
        for service in &manifest.services {
            let mut depends_on = service.depends_on.clone();
            depends_on.push(ORCHESTRATOR_NODE.to_string());
            definitions.push(
                NodeDefinition::new(service.id.clone(), depends_on, service.probe.build())
                    .supervised(!service.restart_command.is_empty()),
            );
        }
        Self::new(definitions, probe_timeout, probe_interval)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.graph.contains(service_id)
    }

    pub fn subscribe_restarts(&self) -> broadcast::Receiver<RestartRequest> {
        self.restarts.subscribe()
    }

    pub fn state(&self, service_id: &str) -> Option<NodeState> {
        self.nodes.borrow().get(service_id).map(|r| r.state.clone())
    }

    /// Run one startup pass until every node is Ready, Failed or blocked
    /// behind a failure, or until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> StartupReport {
        self.running.store(true, Ordering::SeqCst);
        info!(nodes = self.graph.len(), "startup coordinator running");

        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            for service_id in self.launchable() {
                let Some(probe) = self.probes.get(&service_id).cloned() else { continue };
                self.set_state(&service_id, NodeState::Starting);

                let (timeout, interval) = (self.probe_timeout, self.probe_interval);
                let node_cancel = cancel.child_token();
                let span = crate::node_span!(service_id);
                let id = service_id.clone();
                let handle = tasks.spawn(
                    async move {
                        info!("launch released, probing health");
                        let outcome = probe_until_healthy(probe.as_ref(), timeout, interval, &node_cancel).await;
                        (id, outcome)
                    }
                    .instrument(span),
                );
                in_flight.insert(handle.id(), service_id);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                Some(joined) = tasks.join_next_with_id() => match joined {
                    Ok((task_id, (service_id, outcome))) => {
                        in_flight.remove(&task_id);
                        match outcome {
                            Ok(()) => {
                                info!(service_id = %service_id, "node ready");
                                self.set_state(&service_id, NodeState::Ready);
                            }
                            Err(reason) => {
                                error!(service_id = %service_id, reason = %reason, "node failed");
                                self.set_state(&service_id, NodeState::Failed(reason));
                            }
                        }
                    }
                    Err(join_error) => {
                        if let Some(service_id) = in_flight.remove(&join_error.id()) {
                            error!(service_id = %service_id, error = %join_error, "node task aborted");
                            self.set_state(&service_id, NodeState::Failed(join_error.to_string()));
                        }
                    }
                },
            }
        }

        if cancel.is_cancelled() {
            self.cancel_unfinished();
        }

        let report = self.report(cancel.is_cancelled());
        if report.is_complete() {
            info!(ready = report.ready.len(), "startup complete");
        } else {
            for error in report.dependency_errors() {
                warn!(error = %error, "node blocked");
            }
            warn!(
                ready = report.ready.len(),
                failed = report.failed.len(),
                blocked = report.blocked.len(),
                cancelled = report.cancelled,
                "startup finished degraded"
            );
        }
        report
    }

    /// Block until the node's launch is released (Starting or Ready).
    /// Returns false on timeout or if the node failed.
    pub async fn wait_until_ready(&self, service_id: &str, timeout: Duration) -> Result<bool> {
        if !self.graph.contains(service_id) {
            return Err(Error::not_found("service", service_id));
        }

        let mut rx = self.nodes.subscribe();
        let wait = rx.wait_for(|nodes| {
            nodes.get(service_id).map_or(true, |r| r.state.is_released() || matches!(r.state, NodeState::Failed(_)))
        });

        let released = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(nodes)) => nodes.get(service_id).is_some_and(|r| r.state.is_released()),
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(service_id, timeout_ms = timeout.as_millis() as u64, "gate wait timed out");
                false
            }
        };
        Ok(released)
    }

    /// Restart `service_ids` and everything downstream of them, in dependency
    /// order, waiting for each to report healthy before moving on. Pending
    /// nodes are skipped. Returns the services restarted.
    ///
    /// Supervised nodes are probed only after a supervisor acknowledges the
    /// restart; with no supervisor subscribed the restart fails. Other nodes
    /// reload on their own and are probed right away. `timeout` bounds the
    /// acknowledgement and the probe of each node together.
    pub async fn restart(&self, service_ids: &[String], reason: &str, timeout: Duration) -> Result<Vec<String>> {
        let _guard = self.restart_lock.lock().await;
        let order = self.graph.restart_order(service_ids.iter().map(String::as_str));
        let mut restarted = Vec::with_capacity(order.len());

        for service_id in order {
            if matches!(self.state(&service_id), Some(NodeState::Pending) | None) {
                debug!(service_id = %service_id, "skipping restart of node that never launched");
                continue;
            }
            let Some(probe) = self.probes.get(&service_id).cloned() else { continue };
            let deadline = Instant::now() + timeout;
            let rotation_timeout = || Error::RotationTimeout { service_id: service_id.clone(), timeout_secs: timeout.as_secs() };

            let (request, ack) = RestartRequest::new(&service_id, reason);
            let delivered = self.restarts.send(request).is_ok();
            if self.supervised.contains(&service_id) {
                if !delivered {
                    error!(service_id = %service_id, "no supervisor subscribed to carry out the restart");
                    return Err(rotation_timeout());
                }
                self.set_state(&service_id, NodeState::Starting);
                let failure = match tokio::time::timeout_at(deadline, ack).await {
                    Ok(Ok(Ok(()))) => None,
                    Ok(Ok(Err(reason))) => Some(reason),
                    Ok(Err(_)) => Some("restart request dropped without acknowledgement".to_string()),
                    Err(_) => Some("restart was not acknowledged in time".to_string()),
                };
                if let Some(reason) = failure {
                    error!(service_id = %service_id, reason = %reason, "restart did not complete");
                    self.set_state(&service_id, NodeState::Failed(reason));
                    return Err(rotation_timeout());
                }
            } else {
                if !delivered {
                    debug!(service_id = %service_id, "no supervisor subscribed to restart requests");
                }
                self.set_state(&service_id, NodeState::Starting);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = probe_until_healthy(probe.as_ref(), remaining, self.probe_interval, &CancellationToken::new())
                .instrument(crate::node_span!(service_id, restart = true))
                .await;
            match outcome {
                Ok(()) => {
                    info!(service_id = %service_id, "restarted node is healthy");
                    self.set_state(&service_id, NodeState::Ready);
                    restarted.push(service_id.clone());
                }
                Err(reason) => {
                    error!(service_id = %service_id, reason = %reason, "restarted node never became healthy");
                    self.set_state(&service_id, NodeState::Failed(reason));
                    return Err(rotation_timeout());
                }
            }
        }
        Ok(restarted)
    }

    pub fn set_credentials_degraded(&self, service_id: &str, degraded: bool) {
        self.nodes.send_if_modified(|nodes| match nodes.get_mut(service_id) {
            Some(record) if record.credentials_degraded != degraded => {
                record.credentials_degraded = degraded;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        });
    }

    pub fn status(&self, service_id: &str) -> Option<ServiceStatus> {
        let nodes = self.nodes.borrow();
        nodes.get(service_id).map(|record| self.derive_status(service_id, record, &nodes))
    }

    /// Every node in dependency order
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.borrow();
        self.graph
            .order()
            .iter()
            .filter_map(|id| {
                nodes.get(id).map(|record| NodeSnapshot {
                    service_id: id.clone(),
                    depends_on: self.graph.dependencies(id).cloned().collect(),
                    state: record.state.clone(),
                    status: self.derive_status(id, record, &nodes),
                    credentials_degraded: record.credentials_degraded,
                    updated_at: record.updated_at,
                })
            })
            .collect()
    }

    fn derive_status(&self, id: &str, record: &NodeRecord, nodes: &BTreeMap<String, NodeRecord>) -> ServiceStatus {
        if record.credentials_degraded && !matches!(record.state, NodeState::Pending | NodeState::Starting) {
            return ServiceStatus::CredentialsDegraded;
        }
        match &record.state {
            NodeState::Ready => ServiceStatus::Healthy,
            NodeState::Starting => ServiceStatus::Starting,
            NodeState::Failed(_) => ServiceStatus::Failed,
            NodeState::Pending => {
                let waiting = self
                    .graph
                    .dependencies(id)
                    .any(|dep| nodes.get(dep).is_some_and(|r| r.state != NodeState::Ready));
                if self.running.load(Ordering::SeqCst) && waiting {
                    ServiceStatus::WaitingOnDependency
                } else {
                    ServiceStatus::NotStarted
                }
            }
        }
    }

    /// Pending nodes whose dependencies are all Ready, in dependency order.
    fn launchable(&self) -> Vec<String> {
        let nodes = self.nodes.borrow();
        self.graph
            .order()
            .iter()
            .filter(|id| nodes.get(*id).is_some_and(|r| r.state == NodeState::Pending))
            .filter(|id| {
                self.graph
                    .dependencies(id)
                    .all(|dep| nodes.get(dep).is_some_and(|r| r.state == NodeState::Ready))
            })
            .cloned()
            .collect()
    }

    fn set_state(&self, service_id: &str, state: NodeState) {
        metrics::record_node_state(service_id, state.as_str());
        self.nodes.send_modify(|nodes| {
            if let Some(record) = nodes.get_mut(service_id) {
                record.state = state;
                record.updated_at = Utc::now();
            }
        });
    }

    /// Ready nodes are never cancelled.
    fn cancel_unfinished(&self) {
        let unfinished: Vec<String> = self
            .nodes
            .borrow()
            .iter()
            .filter(|(_, r)| matches!(r.state, NodeState::Pending | NodeState::Starting))
            .map(|(id, _)| id.clone())
            .collect();
        for service_id in unfinished {
            warn!(service_id = %service_id, "node cancelled");
            self.set_state(&service_id, NodeState::Failed("cancelled".to_string()));
        }
    }

    fn report(&self, cancelled: bool) -> StartupReport {
        let nodes = self.nodes.borrow();
        let mut report = StartupReport { cancelled, ..Default::default() };

        for id in self.graph.order() {
            let Some(record) = nodes.get(id) else { continue };
            match &record.state {
                NodeState::Ready => report.ready.push(id.clone()),
                NodeState::Failed(reason) => {
                    report.failed.insert(id.clone(), reason.clone());
                }
                NodeState::Pending | NodeState::Starting => {
                    let failed = self.failed_ancestors(id, &nodes);
                    report.blocked.insert(id.clone(), failed);
                }
            }
        }
        report
    }

    fn failed_ancestors(&self, id: &str, nodes: &BTreeMap<String, NodeRecord>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&String> = self.graph.dependencies(id).collect();
        let mut failed = Vec::new();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            if matches!(nodes.get(dep).map(|r| &r.state), Some(NodeState::Failed(_))) {
                failed.push(dep.clone());
            } else {
                stack.extend(self.graph.dependencies(dep));
            }
        }
        failed.sort();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::probe::{FnProbe, NoProbe};
    use std::sync::atomic::AtomicBool;

    fn healthy() -> Arc<dyn HealthProbe> {
        Arc::new(NoProbe)
    }

    fn never() -> Arc<dyn HealthProbe> {
        Arc::new(FnProbe::new("never", || async { false }))
    }

    fn toggle(flag: Arc<AtomicBool>) -> Arc<dyn HealthProbe> {
        Arc::new(FnProbe::new("toggle", move || {
            let flag = flag.clone();
            async move { flag.load(Ordering::SeqCst) }
        }))
    }

    fn node(id: &str, deps: &[&str], probe: Arc<dyn HealthProbe>) -> NodeDefinition {
        NodeDefinition::new(id, deps.iter().map(|d| d.to_string()).collect(), probe)
    }

    fn coordinator(nodes: Vec<NodeDefinition>) -> StartupCoordinator {
        StartupCoordinator::new(nodes, Duration::from_secs(5), Duration::from_millis(100)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_node_blocks_only_its_branch() {
        let c = coordinator(vec![
            node("a", &[], never()),
            node("b", &["a"], healthy()),
            node("c", &["b"], healthy()),
            node("d", &[], healthy()),
        ]);

        let report = c.run(CancellationToken::new()).await;

        assert_eq!(report.ready, vec!["d"]);
        assert!(report.failed.contains_key("a"));
        assert_eq!(report.blocked.get("b"), Some(&vec!["a".to_string()]));
        assert_eq!(report.blocked.get("c"), Some(&vec!["a".to_string()]));
        assert_eq!(c.state("b"), Some(NodeState::Pending));
        assert_eq!(c.status("c"), Some(ServiceStatus::WaitingOnDependency));
        assert_eq!(c.status("a"), Some(ServiceStatus::Failed));
        assert_eq!(c.status("d"), Some(ServiceStatus::Healthy));
        assert!(matches!(report.dependency_errors()[0], Error::DependencyFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_starts_in_order() {
        let c = coordinator(vec![
            node("c", &["b"], healthy()),
            node("b", &["a"], healthy()),
            node("a", &[], healthy()),
        ]);
        let report = c.run(CancellationToken::new()).await;
        assert!(report.is_complete());
        assert_eq!(report.ready, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_releases_when_dependencies_ready() {
        let up = Arc::new(AtomicBool::new(false));
        let c = Arc::new(coordinator(vec![node("db", &[], toggle(up.clone())), node("app", &["db"], healthy())]));

        assert_eq!(c.status("app"), Some(ServiceStatus::NotStarted));

        let runner = {
            let c = c.clone();
            tokio::spawn(async move { c.run(CancellationToken::new()).await })
        };

        assert!(!c.wait_until_ready("app", Duration::from_millis(500)).await.unwrap());
        up.store(true, Ordering::SeqCst);
        assert!(c.wait_until_ready("app", Duration::from_secs(2)).await.unwrap());

        let report = runner.await.unwrap();
        assert!(report.is_complete());
        assert!(c.wait_until_ready("ghost", Duration::from_millis(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_returns_false_for_failed_node() {
        let c = coordinator(vec![node("a", &[], never())]);
        c.run(CancellationToken::new()).await;
        assert!(!c.wait_until_ready("a", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_ready_nodes() {
        let c = Arc::new(coordinator(vec![
            node("fast", &[], healthy()),
            node("slow", &["fast"], never()),
            node("after", &["slow"], healthy()),
        ]));
        let cancel = CancellationToken::new();

        let runner = {
            let (c, cancel) = (c.clone(), cancel.clone());
            tokio::spawn(async move { c.run(cancel).await })
        };
        assert!(c.wait_until_ready("slow", Duration::from_secs(1)).await.unwrap());
        cancel.cancel();

        let report = runner.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(c.state("fast"), Some(NodeState::Ready));
        assert_eq!(c.state("slow"), Some(NodeState::Failed("cancelled".into())));
        assert_eq!(c.state("after"), Some(NodeState::Failed("cancelled".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_broadcasts_in_dependency_order() {
        let c = coordinator(vec![
            node("db", &[], healthy()),
            node("app", &["db"], healthy()),
            node("cache", &[], healthy()),
        ]);
        c.run(CancellationToken::new()).await;
        let mut rx = c.subscribe_restarts();

        let restarted = c.restart(&["db".to_string()], "certificate rotated", Duration::from_secs(5)).await.unwrap();
        assert_eq!(restarted, vec!["db", "app"]);
        assert_eq!(rx.recv().await.unwrap().service_id, "db");
        assert_eq!(rx.recv().await.unwrap().service_id, "app");
        assert_eq!(c.state("cache"), Some(NodeState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_timeout_and_degraded_status() {
        let up = Arc::new(AtomicBool::new(true));
        let c = coordinator(vec![node("db", &[], toggle(up.clone()))]);
        c.run(CancellationToken::new()).await;

        up.store(false, Ordering::SeqCst);
        let err = c.restart(&["db".to_string()], "rotation", Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, Error::RotationTimeout { timeout_secs: 3, .. }));

        c.set_credentials_degraded("db", true);
        assert_eq!(c.status("db"), Some(ServiceStatus::CredentialsDegraded));
        let snapshot = c.snapshot();
        assert!(snapshot[0].credentials_degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervised_restart_without_supervisor_fails() {
        let c = coordinator(vec![node("db", &[], healthy()).supervised(true)]);
        c.run(CancellationToken::new()).await;

        let err = c.restart(&["db".to_string()], "rotation", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::RotationTimeout { ref service_id, .. } if service_id == "db"));
        assert_eq!(c.state("db"), Some(NodeState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervised_restart_probes_after_acknowledgement() {
        let c = coordinator(vec![node("db", &[], healthy()).supervised(true)]);
        c.run(CancellationToken::new()).await;

        let acknowledged = Arc::new(AtomicBool::new(false));
        let mut rx = c.subscribe_restarts();
        let supervisor = {
            let acknowledged = acknowledged.clone();
            tokio::spawn(async move {
                let request = rx.recv().await.unwrap();
                tokio::time::sleep(Duration::from_secs(2)).await;
                acknowledged.store(true, Ordering::SeqCst);
                request.ack.complete(Ok(()));
                request.service_id
            })
        };

        let restarted = c.restart(&["db".to_string()], "rotation", Duration::from_secs(5)).await.unwrap();
        assert!(acknowledged.load(Ordering::SeqCst));
        assert_eq!(restarted, vec!["db"]);
        assert_eq!(supervisor.await.unwrap(), "db");
        assert_eq!(c.state("db"), Some(NodeState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_command_fails_node() {
        let c = coordinator(vec![node("db", &[], healthy()).supervised(true)]);
        c.run(CancellationToken::new()).await;

        let mut rx = c.subscribe_restarts();
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            request.ack.complete(Err("exit code 1".to_string()));
        });

        let err = c.restart(&["db".to_string()], "rotation", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::RotationTimeout { .. }));
        assert_eq!(c.state("db"), Some(NodeState::Failed("exit code 1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_restart_times_out() {
        let c = coordinator(vec![node("db", &[], healthy()).supervised(true)]);
        c.run(CancellationToken::new()).await;
        let _rx = c.subscribe_restarts();

        let err = c.restart(&["db".to_string()], "rotation", Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, Error::RotationTimeout { timeout_secs: 3, .. }));
        assert!(matches!(c.state("db"), Some(NodeState::Failed(_))));
    }

    #[test]
    fn test_manifest_nodes_depend_on_orchestrator() {
        let manifest = ServiceManifest::from_yaml("services:\n  - id: redis\n").unwrap();
        let c = StartupCoordinator::from_manifest(&manifest, healthy(), Duration::from_secs(1), Duration::from_millis(10))
            .unwrap();
        assert_eq!(c.graph().order(), &[ORCHESTRATOR_NODE.to_string(), "redis".to_string()]);
        assert!(!c.supervised.contains("redis"));
        assert_eq!(c.graph().dependencies("redis").collect::<Vec<_>>(), vec![ORCHESTRATOR_NODE]);
    }

    #[test]
    fn test_manifest_restart_command_marks_node_supervised() {
        let manifest = ServiceManifest::from_yaml(
            "services:\n  - id: pgbouncer\n    restart_command: [systemctl, restart, pgbouncer]\n  - id: redis\n",
        )
        .unwrap();
        let c = StartupCoordinator::from_manifest(&manifest, healthy(), Duration::from_secs(1), Duration::from_millis(10))
            .unwrap();
        assert!(c.supervised.contains("pgbouncer"));
        assert!(!c.supervised.contains("redis"));
    }
}
