//! Administrative endpoints. The router wraps all of them in the admin scope
//! check; each mutating call is written to the audit log.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::instrument;
use validator::Validate;

use crate::api::dto::{
    AuditQuery, BootstrapPkiRequest, CaResponse, DefineRoleRequest, IssueRequest, ListQuery, ListResponse,
    PutCredentialsRequest, PutCredentialsResponse, RevokeRequest, RoleResponse, TokenResponse,
};
use crate::api::error::ApiError;
use crate::api::routes::ApiState;
use crate::audit::AuditEntry;
use crate::auth::AuthContext;
use crate::errors::Result;
use crate::orchestrator::OrchestratorStatus;
use crate::pki::{CaHierarchy, LeafCertificate, LedgerEntry};
use crate::rotation::ServiceRotation;
use crate::secrets::{generate_password, CredentialRecord, SecretString};

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 10_000;

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

async fn audited<T>(state: &ApiState, entry: AuditEntry, result: Result<T>) -> std::result::Result<T, ApiError> {
    state.orchestrator.audit().record(entry.outcome(&result)).await;
    result.map_err(ApiError::from)
}

#[instrument(skip(state, context, payload), fields(token_id = %context.token_id))]
pub async fn put_credentials_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
    Json(payload): Json<PutCredentialsRequest>,
) -> std::result::Result<(StatusCode, Json<PutCredentialsResponse>), ApiError> {
    payload.validate()?;
    let password = payload.password.map(SecretString::new).unwrap_or_else(generate_password);
    let mut record = CredentialRecord::new(&service_id, payload.username, password)
        .with_tls(payload.tls_enabled.unwrap_or(true));
    record.extra_fields = payload.extra_fields;

    let store = state.orchestrator.store();
    let result = match payload.expected_version {
        Some(expected) => store.put_if_version(&service_id, record, expected).await,
        None => store.put(&service_id, record).await,
    };
    let entry = AuditEntry::new("credentials.write", service_id.as_str(), context.actor());
    let version = audited(&state, entry, result).await?;
    Ok((StatusCode::CREATED, Json(PutCredentialsResponse { service_id, version })))
}

pub async fn list_credentials_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<ListResponse>, ApiError> {
    let paths = state.orchestrator.store().list(query.prefix.as_deref().unwrap_or("")).await?;
    Ok(Json(ListResponse { paths }))
}

#[instrument(skip(state, context, payload), fields(token_id = %context.token_id))]
pub async fn bootstrap_pki_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<BootstrapPkiRequest>,
) -> std::result::Result<(StatusCode, Json<CaHierarchy>), ApiError> {
    payload.validate()?;
    let pki = &state.orchestrator.config().pki;
    let root = payload.root_validity_hours.map(hours).unwrap_or_else(|| pki.root_validity());
    let intermediate =
        payload.intermediate_validity_hours.map(hours).unwrap_or_else(|| pki.intermediate_validity());

    let result = state.orchestrator.ca().bootstrap(root, intermediate).await;
    let entry = AuditEntry::new("pki.bootstrap", "ca", context.actor());
    let hierarchy = audited(&state, entry, result).await?;
    Ok((StatusCode::CREATED, Json(hierarchy)))
}

#[instrument(skip(state, context, payload), fields(token_id = %context.token_id, service_id = %payload.service_id))]
pub async fn define_role_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<DefineRoleRequest>,
) -> std::result::Result<Json<RoleResponse>, ApiError> {
    payload.validate()?;
    let key_size = payload.key_size.unwrap_or(state.orchestrator.config().pki.default_key_size);
    let result = state
        .orchestrator
        .ca()
        .define_role(&payload.service_id, payload.allowed_common_names, hours(payload.max_ttl_hours), key_size)
        .await;
    let entry = AuditEntry::new("pki.define_role", payload.service_id.as_str(), context.actor());
    Ok(Json(audited(&state, entry, result).await?.into()))
}

#[instrument(skip(state, context, payload), fields(token_id = %context.token_id, service_id = %payload.service_id))]
pub async fn issue_certificate_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<IssueRequest>,
) -> std::result::Result<(StatusCode, Json<LeafCertificate>), ApiError> {
    payload.validate()?;
    let ca = state.orchestrator.ca();
    let result = async {
        let ttl = match payload.ttl_hours {
            Some(h) => hours(h),
            None => ca.role(&payload.service_id).await?.max_ttl,
        };
        ca.issue(&payload.service_id, ttl, payload.subject_alt_names.clone()).await
    }
    .await;

    let entry = AuditEntry::new("pki.issue", payload.service_id.as_str(), context.actor());
    let entry = match &result {
        Ok(leaf) => entry.with_detail(format!("serial={}", leaf.serial_number)),
        Err(_) => entry,
    };
    let leaf = audited(&state, entry, result).await?;
    Ok((StatusCode::CREATED, Json(leaf)))
}

pub async fn revoke_certificate_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<RevokeRequest>,
) -> std::result::Result<Json<LedgerEntry>, ApiError> {
    let result = state.orchestrator.ca().revoke(payload.serial_number).await;
    let entry = AuditEntry::new("pki.revoke", payload.serial_number.to_string(), context.actor());
    Ok(Json(audited(&state, entry, result).await?))
}

pub async fn get_ca_handler(State(state): State<ApiState>) -> std::result::Result<Json<CaResponse>, ApiError> {
    let ca = state.orchestrator.ca();
    Ok(Json(CaResponse { hierarchy: ca.hierarchy().await?, ca_bundle_pem: ca.export_ca_bundle().await? }))
}

pub async fn issue_token_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
) -> std::result::Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let result = state.orchestrator.tokens().issue_service_token(&service_id).await;
    let entry = AuditEntry::new("token.issue", service_id.as_str(), context.actor());
    let token = audited(&state, entry, result).await?;
    Ok((StatusCode::CREATED, Json(TokenResponse { service_id, token: token.expose_secret().to_string() })))
}

#[instrument(skip(state, context), fields(token_id = %context.token_id))]
pub async fn rotate_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
    Path(service_id): Path<String>,
) -> std::result::Result<Json<ServiceRotation>, ApiError> {
    let result = state.orchestrator.scheduler().force_rotate(&service_id).await;
    let entry = AuditEntry::new("rotation.force", service_id.as_str(), context.actor());
    Ok(Json(audited(&state, entry, result).await?))
}

pub async fn status_handler(
    State(state): State<ApiState>,
) -> std::result::Result<Json<OrchestratorStatus>, ApiError> {
    Ok(Json(state.orchestrator.status().await?))
}

pub async fn audit_handler(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> std::result::Result<Json<Vec<AuditEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    Ok(Json(state.orchestrator.audit().recent(limit).await?))
}
