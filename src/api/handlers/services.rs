//! Endpoints a service token may call for its own id: the startup gate and
//! credential/TLS retrieval.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use tracing::instrument;

use crate::api::dto::{GateQuery, GateResponse, VersionResponse};
use crate::api::error::ApiError;
use crate::api::routes::ApiState;
use crate::audit::AuditEntry;
use crate::auth::AuthContext;
use crate::broker::CredentialSource;
use crate::pki::TlsBundle;
use crate::secrets::CredentialRecord;

/// Block until the service's dependencies are ready, up to `timeout_secs`
/// (capped at the server request timeout).
#[instrument(skip(state, context), fields(token_id = %context.token_id))]
pub async fn gate_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
    Query(query): Query<GateQuery>,
) -> Result<Json<GateResponse>, ApiError> {
    context.require_service(&service_id)?;
    let orchestrator = &state.orchestrator;
    let config = orchestrator.config();
    let timeout = query
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.startup.probe_timeout())
        .min(config.server.timeout());

    let coordinator = orchestrator.coordinator();
    let ready = coordinator.wait_until_ready(&service_id, timeout).await?;
    Ok(Json(GateResponse { status: coordinator.status(&service_id), service_id, ready }))
}

#[instrument(skip(state, context), fields(token_id = %context.token_id))]
pub async fn get_credentials_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
) -> Result<Json<CredentialRecord>, ApiError> {
    context.require_service(&service_id)?;
    let result = state.orchestrator.credentials(&service_id).await;
    let entry = AuditEntry::new("credentials.read", service_id.as_str(), context.actor()).outcome(&result);
    state.orchestrator.audit().record(entry).await;
    Ok(Json(result?))
}

pub async fn get_credentials_version_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
) -> Result<Json<VersionResponse>, ApiError> {
    context.require_service(&service_id)?;
    let version = state.orchestrator.current_version(&service_id).await?;
    Ok(Json(VersionResponse { service_id, version }))
}

#[instrument(skip(state, context), fields(token_id = %context.token_id))]
pub async fn get_tls_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
) -> Result<Json<TlsBundle>, ApiError> {
    context.require_service(&service_id)?;
    let result = state.orchestrator.tls_material(&service_id).await;
    let entry = AuditEntry::new("tls.read", service_id.as_str(), context.actor()).outcome(&result);
    state.orchestrator.audit().record(entry).await;
    Ok(Json(result?))
}
