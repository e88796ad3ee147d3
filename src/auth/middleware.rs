//! Axum middleware for bearer-token authentication.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, State},
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::Response,
};
use tracing::{field, info_span, warn, Instrument};

use crate::api::error::ApiError;
use crate::auth::tokens::{AuthContext, TokenStore};

pub type TokenStoreState = Arc<TokenStore>;

/// Resolve the bearer token and attach the [`AuthContext`] to the request.
pub async fn authenticate(
    State(tokens): State<TokenStoreState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let correlation_id = uuid::Uuid::new_v4();
    let span = info_span!(
        "auth_middleware.authenticate",
        http.method = %method,
        http.path = %path,
        auth.token_id = field::Empty,
        correlation_id = %correlation_id
    );

    let header = request.headers().get(AUTHORIZATION).and_then(|value| value.to_str().ok()).unwrap_or("");

    match tokens.authenticate(header).instrument(span.clone()).await {
        Ok(context) => {
            span.record("auth.token_id", field::display(&context.token_id));
            request.extensions_mut().insert(context);
            Ok(next.run(request).instrument(span).await)
        }
        Err(err) => {
            warn!(%correlation_id, http.path = %path, error = %err, "authentication failed");
            Err(ApiError::from(err))
        }
    }
}

/// Reject callers whose token is not admin-scoped.
pub async fn require_admin(
    Extension(context): Extension<AuthContext>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Err(err) = context.require_admin() {
        warn!(
            token_id = %context.token_id,
            scope = %context.scope,
            http.path = %request.uri().path(),
            "admin scope check failed"
        );
        return Err(ApiError::from(err));
    }
    Ok(next.run(request).await)
}
