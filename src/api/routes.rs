use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::{authenticate, require_admin};
use crate::orchestrator::Orchestrator;

use super::handlers::{
    audit_handler, bootstrap_pki_handler, define_role_handler, gate_handler, get_ca_handler,
    get_credentials_handler, get_credentials_version_handler, get_tls_handler, health_handler, init_handler,
    issue_certificate_handler, issue_token_handler, list_credentials_handler, put_credentials_handler,
    revoke_certificate_handler, rotate_handler, seal_handler, seal_status_handler, status_handler,
    unseal_handler,
};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let max_body_size = orchestrator.config().server.max_body_size;
    let api_state = ApiState { orchestrator: orchestrator.clone() };
    let auth_layer = middleware::from_fn_with_state(orchestrator.tokens().clone(), authenticate);

    let public = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/sys/seal-status", get(seal_status_handler))
        .route("/v1/sys/init", post(init_handler))
        .route("/v1/sys/unseal", post(unseal_handler));

    let service_scoped = Router::new()
        .route("/v1/gate/{service_id}", get(gate_handler))
        .route("/v1/credentials/{service_id}", get(get_credentials_handler))
        .route("/v1/credentials/{service_id}/version", get(get_credentials_version_handler))
        .route("/v1/tls/{service_id}", get(get_tls_handler));

    let admin = Router::new()
        .route("/v1/sys/seal", post(seal_handler))
        .route("/v1/admin/credentials", get(list_credentials_handler))
        .route("/v1/admin/credentials/{service_id}", put(put_credentials_handler))
        .route("/v1/admin/pki/bootstrap", post(bootstrap_pki_handler))
        .route("/v1/admin/pki/roles", post(define_role_handler))
        .route("/v1/admin/pki/issue", post(issue_certificate_handler))
        .route("/v1/admin/pki/revoke", post(revoke_certificate_handler))
        .route("/v1/admin/pki/ca", get(get_ca_handler))
        .route("/v1/admin/tokens/{service_id}", post(issue_token_handler))
        .route("/v1/admin/rotate/{service_id}", post(rotate_handler))
        .route("/v1/admin/status", get(status_handler))
        .route("/v1/admin/audit", get(audit_handler))
        .route_layer(middleware::from_fn(require_admin));

    let secured = Router::new().merge(service_scoped).merge(admin).route_layer(auth_layer);

    Router::new()
        .merge(public)
        .merge(secured)
        .with_state(api_state)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
}
