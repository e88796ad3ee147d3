//! # Metrics Collection
//!
//! Prometheus metrics for seal transitions, credential traffic, issuance,
//! rotation outcomes and startup node states.

use std::net::SocketAddr;

use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

const NODE_STATES: &[&str] = &["pending", "starting", "ready", "failed"];

/// Metrics recorder that tracks orchestrator metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record an HTTP request
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration: f64) {
        let labels = [("method", method.to_string()), ("path", path.to_string())];
        counter!("http_requests_total", &labels).increment(1);
        histogram!("http_request_duration_seconds").record(duration);

        let status_label = [("status", status.to_string())];
        counter!("http_responses_total", &status_label).increment(1);
    }

    /// Record one unseal share submission
    pub fn record_unseal_share(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "ignored" };
        counter!("seal_unseal_shares_total", "outcome" => outcome).increment(1);
    }

    /// Record a seal state transition
    pub fn record_seal_transition(&self, state: &str) {
        counter!("seal_transitions_total", "state" => state.to_string()).increment(1);
        gauge!("seal_unsealed").set(if state == "unsealed" { 1.0 } else { 0.0 });
    }

    pub fn record_credential_write(&self, path: &str) {
        counter!("secret_store_writes_total", "path" => path.to_string()).increment(1);
    }

    pub fn record_certificate_issued(&self, service_id: &str) {
        counter!("pki_certificates_issued_total", "service_id" => service_id.to_string())
            .increment(1);
    }

    pub fn record_certificate_revoked(&self) {
        counter!("pki_certificates_revoked_total").increment(1);
    }

    /// Record a broker fetch outcome (`kind` is `credentials` or `tls`)
    pub fn record_broker_fetch(&self, service_id: &str, kind: &str, success: bool, duration: f64) {
        let status = if success { "success" } else { "error" };
        let labels = [
            ("service_id", service_id.to_string()),
            ("kind", kind.to_string()),
            ("status", status.to_string()),
        ];
        counter!("broker_fetches_total", &labels).increment(1);
        histogram!("broker_fetch_duration_seconds", "kind" => kind.to_string()).record(duration);
    }

    /// Record a rotation cycle outcome (`rolled_out`, `timeout`, `error`)
    pub fn record_rotation(&self, service_id: &str, kind: &str, outcome: &str) {
        let labels = [
            ("service_id", service_id.to_string()),
            ("kind", kind.to_string()),
            ("outcome", outcome.to_string()),
        ];
        counter!("rotation_cycles_total", &labels).increment(1);
    }

    pub fn record_alert(&self, severity: &str) {
        counter!("rotation_alerts_total", "severity" => severity.to_string()).increment(1);
    }

    /// Track which state a startup node currently occupies
    pub fn record_node_state(&self, service_id: &str, state: &str) {
        for candidate in NODE_STATES {
            let value = if *candidate == state { 1.0 } else { 0.0 };
            gauge!(
                "startup_node_state",
                "service_id" => service_id.to_string(),
                "state" => *candidate
            )
            .set(value);
        }
    }

    /// Register baseline metrics so Prometheus exports appear before events occur.
    pub fn register_metrics(&self) {
        describe_counter!("seal_unseal_shares_total", Unit::Count, "Unseal share submissions by outcome");
        describe_counter!("seal_transitions_total", Unit::Count, "Seal state transitions");
        describe_gauge!("seal_unsealed", Unit::Count, "1 when the secret store is unsealed");
        describe_counter!("secret_store_writes_total", Unit::Count, "Credential versions written");
        describe_counter!("pki_certificates_issued_total", Unit::Count, "Leaf certificates issued");
        describe_counter!("pki_certificates_revoked_total", Unit::Count, "Leaf certificates revoked");
        describe_counter!("broker_fetches_total", Unit::Count, "Credential broker fetches");
        describe_histogram!(
            "broker_fetch_duration_seconds",
            Unit::Seconds,
            "Broker fetch latency including retries"
        );
        describe_counter!("rotation_cycles_total", Unit::Count, "Rotation cycles by outcome");
        describe_counter!("rotation_alerts_total", Unit::Count, "Operator alerts raised by severity");
        describe_gauge!("startup_node_state", Unit::Count, "Current startup node state (one-hot)");
        describe_counter!("http_requests_total", Unit::Count, "HTTP requests served");
        describe_histogram!("http_request_duration_seconds", Unit::Seconds, "HTTP request latency");

        gauge!("seal_unsealed").set(0.0);
        counter!("pki_certificates_revoked_total").absolute(0);
        for severity in ["warning", "critical"] {
            counter!("rotation_alerts_total", "severity" => severity).absolute(0);
        }
    }
}

/// Global metrics recorder instance
static METRICS: OnceCell<MetricsRecorder> = OnceCell::new();

/// Initialize metrics collection and the Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    let recorder = METRICS.get_or_init(MetricsRecorder::new);
    recorder.register_metrics();

    info!(metrics_addr = %metrics_addr, service_name = %config.service_name, "Metrics collection initialized");
    Ok(())
}

/// Get the global metrics recorder
pub fn get_metrics() -> Option<&'static MetricsRecorder> {
    METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    if let Some(metrics) = get_metrics() {
        metrics.record_http_request(method, path, status, duration);
    }
}

pub fn record_unseal_share(accepted: bool) {
    if let Some(metrics) = get_metrics() {
        metrics.record_unseal_share(accepted);
    }
}

pub fn record_seal_transition(state: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_seal_transition(state);
    }
}

pub fn record_credential_write(path: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_credential_write(path);
    }
}

pub fn record_certificate_issued(service_id: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_certificate_issued(service_id);
    }
}

pub fn record_certificate_revoked() {
    if let Some(metrics) = get_metrics() {
        metrics.record_certificate_revoked();
    }
}

pub fn record_broker_fetch(service_id: &str, kind: &str, success: bool, duration: f64) {
    if let Some(metrics) = get_metrics() {
        metrics.record_broker_fetch(service_id, kind, success, duration);
    }
}

pub fn record_rotation(service_id: &str, kind: &str, outcome: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_rotation(service_id, kind, outcome);
    }
}

pub fn record_alert(severity: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_alert(severity);
    }
}

pub fn record_node_state(service_id: &str, state: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_node_state(service_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let recorder = MetricsRecorder::new();
        recorder.record_http_request("GET", "/v1/sys/seal-status", 200, 0.01);
        recorder.record_unseal_share(true);
        recorder.record_unseal_share(false);
        recorder.record_seal_transition("unsealed");
        recorder.record_credential_write("svc-a");
        recorder.record_certificate_issued("db");
        recorder.record_certificate_revoked();
        recorder.record_broker_fetch("svc-a", "credentials", true, 0.2);
        recorder.record_rotation("svc-a", "credential", "rolled_out");
        recorder.record_alert("critical");
        recorder.record_node_state("postgres", "ready");
        recorder.register_metrics();
    }

    #[test]
    fn test_global_helpers_without_recorder_are_noops() {
        record_unseal_share(true);
        record_node_state("redis", "starting");
    }

    #[test]
    fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_init_metrics_no_port() {
        let config = ObservabilityConfig { enable_metrics: true, metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}
