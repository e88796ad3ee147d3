//! # REST API
//!
//! HTTP surface of the orchestrator: seal lifecycle, the per-service startup
//! gate and credential retrieval, and administrative PKI/rotation endpoints.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;

pub use error::{ApiError, ErrorBody};
pub use routes::{build_router, ApiState};
pub use server::{serve, start_api_server};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::orchestrator::Orchestrator;
    use crate::startup::ServiceManifest;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_and_auth_boundaries() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let orchestrator = Orchestrator::new(config, ServiceManifest::default()).await.unwrap();
        let router = build_router(orchestrator);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/v1/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/credentials/db")
                    .header("authorization", "Bearer vk_svc_unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
