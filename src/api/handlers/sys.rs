//! Seal lifecycle endpoints. `init`, `unseal` and `seal-status` are reachable
//! without a token; the shares themselves are the credential.

use axum::{extract::State, http::StatusCode, Extension, Json};
use tracing::instrument;
use validator::Validate;

use crate::api::dto::{HealthResponse, InitRequest, InitResponse, UnsealRequest};
use crate::api::error::ApiError;
use crate::api::routes::ApiState;
use crate::auth::AuthContext;
use crate::seal::{SealState, SealStatus};

pub async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "ok".to_string() }))
}

pub async fn seal_status_handler(State(state): State<ApiState>) -> Json<SealStatus> {
    Json(state.orchestrator.seal_manager().status().await)
}

#[instrument(skip(state, payload), fields(shares = payload.shares, threshold = payload.threshold))]
pub async fn init_handler(
    State(state): State<ApiState>,
    Json(payload): Json<InitRequest>,
) -> Result<(StatusCode, Json<InitResponse>), ApiError> {
    payload.validate()?;
    let init = state.orchestrator.initialize(payload.shares, payload.threshold).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitResponse {
            shares: init.shares.iter().map(|s| s.expose_secret().to_string()).collect(),
            threshold: init.threshold,
            admin_token: init.admin_token.expose_secret().to_string(),
        }),
    ))
}

pub async fn unseal_handler(
    State(state): State<ApiState>,
    Json(payload): Json<UnsealRequest>,
) -> Json<SealStatus> {
    Json(state.orchestrator.unseal(&payload.share).await)
}

pub async fn seal_handler(
    State(state): State<ApiState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<SealState>, ApiError> {
    Ok(Json(state.orchestrator.seal(&context.actor()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler_returns_ok() {
        let (status, Json(response)) = health_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.status, "ok");
    }
}
