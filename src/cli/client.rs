//! HTTP client for the vaultkeeper API
//!
//! Used by the CLI and by the remote credential broker. Error responses are
//! decoded back into [`crate::Error`] so callers see the same variants they
//! would in-process.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};

use crate::api::dto::{
    BootstrapPkiRequest, CaResponse, DefineRoleRequest, GateResponse, InitRequest, InitResponse, IssueRequest,
    ListResponse, PutCredentialsRequest, PutCredentialsResponse, RevokeRequest, RoleResponse, TokenResponse,
    UnsealRequest, VersionResponse,
};
use crate::api::ErrorBody;
use crate::audit::AuditEntry;
use crate::errors::{Error, Result};
use crate::orchestrator::OrchestratorStatus;
use crate::pki::{CaHierarchy, LeafCertificate, LedgerEntry, TlsBundle};
use crate::rotation::ServiceRotation;
use crate::seal::{SealState, SealStatus};
use crate::secrets::CredentialRecord;

/// Slack added to the request timeout of a gate call on top of the wait itself
const GATE_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API (e.g., "http://127.0.0.1:8200")
    pub base_url: String,

    /// Bearer token; unauthenticated endpoints work without one
    pub token: Option<String>,

    /// Request timeout in seconds
    pub timeout: u64,

    /// Enable verbose request/response logging
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:8200".to_string(), token: None, timeout: 30, verbose: false }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| Error::transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        debug!("{} {}", method, url);

        let builder = self.client.request(method, &url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout("api request", self.config.timeout * 1000)
            } else {
                Error::transport(format!("request to {} failed: {}", self.config.base_url, e))
            }
        })?;
        self.handle_response(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(reqwest::Method::POST, path).json(body)).await
    }

    async fn put_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(reqwest::Method::PUT, path).json(body)).await
    }

    /// Check the status and decode the JSON body, or rebuild the server's error.
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        debug!("Response status: {}", status);

        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("Failed to read response body: {}", e)))?;
        if self.config.verbose {
            trace!("Response body:\n{}", body);
        }

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error_body) => error_body.into_error(),
                Err(_) if status.is_server_error() => {
                    Error::transport(format!("HTTP {} from server: {}", status, body))
                }
                Err(_) => Error::internal(format!("HTTP request failed with status {}: {}", status, body)),
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::serialization(e, "decoding API response"))
    }

    // === System ===

    pub async fn health(&self) -> Result<()> {
        let _: serde_json::Value = self.get_json("/health").await?;
        Ok(())
    }

    pub async fn seal_status(&self) -> Result<SealStatus> {
        self.get_json("/v1/sys/seal-status").await
    }

    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse> {
        self.post_json("/v1/sys/init", &InitRequest { shares, threshold }).await
    }

    pub async fn unseal(&self, share: &str) -> Result<SealStatus> {
        self.post_json("/v1/sys/unseal", &UnsealRequest { share: share.to_string() }).await
    }

    pub async fn seal(&self) -> Result<SealState> {
        self.post_json("/v1/sys/seal", &serde_json::json!({})).await
    }

    // === Service-scoped ===

    /// Block server-side until the service may launch or `timeout` elapses.
    pub async fn wait_until_ready(&self, service_id: &str, timeout: Duration) -> Result<GateResponse> {
        let path = format!("/v1/gate/{}?timeout_secs={}", service_id, timeout.as_secs());
        let builder = self.request(reqwest::Method::GET, &path).timeout(timeout + GATE_TIMEOUT_SLACK);
        self.send(builder).await
    }

    pub async fn credentials(&self, service_id: &str) -> Result<CredentialRecord> {
        self.get_json(&format!("/v1/credentials/{}", service_id)).await
    }

    pub async fn credentials_version(&self, service_id: &str) -> Result<u64> {
        let response: VersionResponse = self.get_json(&format!("/v1/credentials/{}/version", service_id)).await?;
        Ok(response.version)
    }

    pub async fn tls(&self, service_id: &str) -> Result<TlsBundle> {
        self.get_json(&format!("/v1/tls/{}", service_id)).await
    }

    // === Administrative ===

    pub async fn put_credentials(
        &self,
        service_id: &str,
        request: &PutCredentialsRequest,
    ) -> Result<PutCredentialsResponse> {
        self.put_json(&format!("/v1/admin/credentials/{}", service_id), request).await
    }

    pub async fn list_credentials(&self, prefix: &str) -> Result<Vec<String>> {
        let builder = self.request(reqwest::Method::GET, "/v1/admin/credentials").query(&[("prefix", prefix)]);
        let response: ListResponse = self.send(builder).await?;
        Ok(response.paths)
    }

    pub async fn bootstrap_pki(&self, request: &BootstrapPkiRequest) -> Result<CaHierarchy> {
        self.post_json("/v1/admin/pki/bootstrap", request).await
    }

    pub async fn define_role(&self, request: &DefineRoleRequest) -> Result<RoleResponse> {
        self.post_json("/v1/admin/pki/roles", request).await
    }

    pub async fn issue_certificate(&self, request: &IssueRequest) -> Result<LeafCertificate> {
        self.post_json("/v1/admin/pki/issue", request).await
    }

    pub async fn revoke_certificate(&self, serial_number: u64) -> Result<LedgerEntry> {
        self.post_json("/v1/admin/pki/revoke", &RevokeRequest { serial_number }).await
    }

    pub async fn ca(&self) -> Result<CaResponse> {
        self.get_json("/v1/admin/pki/ca").await
    }

    pub async fn issue_service_token(&self, service_id: &str) -> Result<TokenResponse> {
        self.post_json(&format!("/v1/admin/tokens/{}", service_id), &serde_json::json!({})).await
    }

    pub async fn force_rotate(&self, service_id: &str) -> Result<ServiceRotation> {
        self.post_json(&format!("/v1/admin/rotate/{}", service_id), &serde_json::json!({})).await
    }

    pub async fn status(&self) -> Result<OrchestratorStatus> {
        self.get_json("/v1/admin/status").await
    }

    pub async fn audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.get_json(&format!("/v1/admin/audit?limit={}", limit)).await
    }
}
