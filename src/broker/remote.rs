//! Credential source backed by the HTTP API, for services that run outside
//! the orchestrator process.

use async_trait::async_trait;

use super::CredentialSource;
use crate::cli::client::ApiClient;
use crate::errors::Result;
use crate::pki::TlsBundle;
use crate::secrets::CredentialRecord;

#[async_trait]
impl CredentialSource for ApiClient {
    async fn credentials(&self, service_id: &str) -> Result<CredentialRecord> {
        ApiClient::credentials(self, service_id).await
    }

    async fn current_version(&self, service_id: &str) -> Result<u64> {
        self.credentials_version(service_id).await
    }

    async fn tls_material(&self, service_id: &str) -> Result<TlsBundle> {
        self.tls(service_id).await
    }
}
