use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::Error;

/// Error returned by every handler; renders as `{error, message, details}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        ApiError(Error::validation(msg))
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        ApiError(Error::Unauthorized(msg.into()))
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        ApiError(Error::Forbidden(msg.into()))
    }

    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError(Error::from(errors))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() && !self.0.is_retryable() {
            error!(error = %self.0, code = self.0.code(), "request failed");
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

/// Wire form of an [`Error`]. Structured fields travel in `details` so a
/// remote client can rebuild the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Inner message of single-string variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &Error) -> Self {
        let details = match err {
            Error::Sealed | Error::NotInitialized | Error::AlreadyInitialized | Error::AlreadyBootstrapped => None,
            Error::NotFound { resource_type, id } => Some(ErrorDetails {
                resource_type: Some(resource_type.clone()),
                id: Some(id.clone()),
                ..Default::default()
            }),
            Error::DependencyFailed { service_id, failed } => Some(ErrorDetails {
                service_id: Some(service_id.clone()),
                failed: failed.clone(),
                ..Default::default()
            }),
            Error::RotationTimeout { service_id, timeout_secs } => Some(ErrorDetails {
                service_id: Some(service_id.clone()),
                timeout_secs: Some(*timeout_secs),
                ..Default::default()
            }),
            Error::NotConfigured { service_id } => {
                Some(ErrorDetails { service_id: Some(service_id.clone()), ..Default::default() })
            }
            Error::Conflict { path, expected, actual } => Some(ErrorDetails {
                path: Some(path.clone()),
                expected: Some(*expected),
                actual: Some(*actual),
                ..Default::default()
            }),
            Error::Timeout { operation, duration_ms } => Some(ErrorDetails {
                operation: Some(operation.clone()),
                duration_ms: Some(*duration_ms),
                ..Default::default()
            }),
            Error::PolicyViolation { message } | Error::InvalidValidityWindow { message } => {
                Some(ErrorDetails { reason: Some(message.clone()), ..Default::default() })
            }
            Error::Unauthorized(msg)
            | Error::Forbidden(msg)
            | Error::Validation(msg)
            | Error::Config(msg)
            | Error::Crypto(msg)
            | Error::Certificate(msg)
            | Error::Transport(msg)
            | Error::Internal(msg) => Some(ErrorDetails { reason: Some(msg.clone()), ..Default::default() }),
            Error::Io { context, .. } | Error::Serialization { context, .. } => {
                Some(ErrorDetails { reason: Some(context.clone()), ..Default::default() })
            }
        };
        Self { error: err.code().to_string(), message: err.to_string(), details }
    }

    /// Rebuild the error a server reported. Unknown codes become `Internal`.
    pub fn into_error(self) -> Error {
        let d = self.details.unwrap_or_default();
        let reason = d.reason.clone().unwrap_or_else(|| self.message.clone());
        match self.error.as_str() {
            "sealed" => Error::Sealed,
            "not_initialized" => Error::NotInitialized,
            "already_initialized" => Error::AlreadyInitialized,
            "already_bootstrapped" => Error::AlreadyBootstrapped,
            "not_found" => Error::NotFound {
                resource_type: d.resource_type.unwrap_or_else(|| "resource".to_string()),
                id: d.id.unwrap_or_default(),
            },
            "policy_violation" => Error::PolicyViolation { message: reason },
            "invalid_validity_window" => Error::InvalidValidityWindow { message: reason },
            "dependency_failed" => {
                Error::DependencyFailed { service_id: d.service_id.unwrap_or_default(), failed: d.failed }
            }
            "rotation_timeout" => Error::RotationTimeout {
                service_id: d.service_id.unwrap_or_default(),
                timeout_secs: d.timeout_secs.unwrap_or_default(),
            },
            "not_configured" => Error::NotConfigured { service_id: d.service_id.unwrap_or_default() },
            "conflict" => Error::Conflict {
                path: d.path.unwrap_or_default(),
                expected: d.expected.unwrap_or_default(),
                actual: d.actual.unwrap_or_default(),
            },
            "unauthorized" => Error::Unauthorized(reason),
            "forbidden" => Error::Forbidden(reason),
            "validation_error" | "serialization_error" => Error::Validation(reason),
            "config_error" => Error::Config(reason),
            "crypto_error" => Error::Crypto(reason),
            "certificate_error" => Error::Certificate(reason),
            "timeout" => Error::Timeout {
                operation: d.operation.unwrap_or_default(),
                duration_ms: d.duration_ms.unwrap_or_default(),
            },
            "transport_error" => Error::Transport(reason),
            _ => Error::Internal(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = ApiError(Error::Sealed).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "sealed");
        assert_eq!(body["message"], "Secret store is sealed");
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_structured_variants_survive_the_wire() {
        let errors = vec![
            Error::not_found("service", "pgbouncer"),
            Error::DependencyFailed { service_id: "pgbouncer".into(), failed: vec!["postgres".into()] },
            Error::RotationTimeout { service_id: "redis".into(), timeout_secs: 120 },
            Error::NotConfigured { service_id: "redis".into() },
            Error::Conflict { path: "db".into(), expected: 2, actual: 3 },
            Error::policy("ttl exceeds role max"),
            Error::Forbidden("wrong service".into()),
        ];
        for err in errors {
            let body: ErrorBody = serde_json::from_value(serde_json::to_value(ErrorBody::from_error(&err)).unwrap())
                .unwrap();
            let rebuilt = body.into_error();
            assert_eq!(rebuilt.code(), err.code());
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_unknown_code_is_internal() {
        let body = ErrorBody { error: "teapot".into(), message: "short and stout".into(), details: None };
        assert!(matches!(body.into_error(), Error::Internal(msg) if msg == "short and stout"));
    }
}
