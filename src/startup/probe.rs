use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Liveness check for one service. A probe answers "healthy right now"; the
/// coordinator owns the polling and the deadline.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;

    fn describe(&self) -> String;
}

/// Probe declared in the service manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Healthy once a TCP connection is accepted
    Tcp { address: String },
    /// Healthy on any 2xx response
    Http { url: String },
    /// Healthy as soon as the node is launched
    #[default]
    None,
}

impl ProbeSpec {
    pub fn build(&self) -> Arc<dyn HealthProbe> {
        match self {
            ProbeSpec::Tcp { address } => Arc::new(TcpProbe::new(address.clone())),
            ProbeSpec::Http { url } => Arc::new(HttpProbe::new(url.clone())),
            ProbeSpec::None => Arc::new(NoProbe),
        }
    }
}

pub struct TcpProbe {
    address: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), connect_timeout: Duration::from_secs(2) }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url: url.into(), client }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                trace!(url = %self.url, error = %e, "http probe failed");
                false
            }
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct NoProbe;

#[async_trait]
impl HealthProbe for NoProbe {
    async fn check(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

type CheckFn = dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync;

/// Probe backed by a closure; used for in-process nodes such as the seal gate.
#[derive(Clone)]
pub struct FnProbe {
    name: String,
    check: Arc<CheckFn>,
}

impl FnProbe {
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self { name: name.into(), check: Arc::new(move || Box::pin(check())) }
    }
}

impl fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").field("name", &self.name).finish()
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    async fn check(&self) -> bool {
        (self.check)().await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Poll `probe` every `interval` until it succeeds, `timeout` elapses or
/// `cancel` fires. Returns the failure reason on the latter two.
pub async fn probe_until_healthy(
    probe: &dyn HealthProbe,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<(), String> {
    let poll = async {
        loop {
            if probe.check().await {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err("cancelled".to_string()),
        result = tokio::time::timeout(timeout, poll) => result.map_err(|_| {
            format!("health probe {} did not succeed within {}s", probe.describe(), timeout.as_secs())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe::new(address.clone()).check().await);

        drop(listener);
        assert!(!TcpProbe::new(address).check().await);
    }

    #[tokio::test]
    async fn test_http_probe_uses_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(HttpProbe::new(format!("{}/healthz", server.uri())).check().await);
        assert!(!HttpProbe::new(format!("{}/missing", server.uri())).check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_until_healthy_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let probe = FnProbe::new("flaky", move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
        });

        let result = probe_until_healthy(
            &probe,
            Duration::from_secs(10),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_until_healthy_times_out() {
        let probe = FnProbe::new("never", || async { false });
        let err = probe_until_healthy(
            &probe,
            Duration::from_secs(5),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("never"));
    }

    #[test]
    fn test_probe_spec_yaml() {
        let spec: ProbeSpec = serde_yaml::from_str("kind: tcp\naddress: 127.0.0.1:5432\n").unwrap();
        assert_eq!(spec, ProbeSpec::Tcp { address: "127.0.0.1:5432".into() });
        assert_eq!(spec.build().describe(), "tcp://127.0.0.1:5432");
        assert_eq!(ProbeSpec::default().build().describe(), "none");
    }
}
