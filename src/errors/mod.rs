//! # Error Handling
//!
//! Error taxonomy for the vaultkeeper orchestrator, built with `thiserror`.
//!
//! Transient conditions (`Sealed`, `Transport`, `Timeout`) are retried locally by the
//! credential broker. Policy and configuration errors are never retried and surface
//! immediately to the operator.

/// Custom result type for vaultkeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the vaultkeeper orchestrator
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The secret store is not unsealed; callers may retry
    #[error("Secret store is sealed")]
    Sealed,

    /// The seal has never been initialized
    #[error("Secret store is not initialized")]
    NotInitialized,

    /// `Initialize` was called on a store with existing state
    #[error("Secret store is already initialized")]
    AlreadyInitialized,

    /// The CA hierarchy already exists
    #[error("CA hierarchy is already bootstrapped")]
    AlreadyBootstrapped,

    /// No such path, service, role or certificate
    #[error("Resource not found: {resource_type} '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Requested certificate parameters exceed the role bounds
    #[error("Policy violation: {message}")]
    PolicyViolation { message: String },

    /// CA hierarchy timing invariant violated
    #[error("Invalid validity window: {message}")]
    InvalidValidityWindow { message: String },

    /// A node's dependency never reached Ready
    #[error("Service '{service_id}' blocked by failed dependencies: {}", .failed.join(", "))]
    DependencyFailed { service_id: String, failed: Vec<String> },

    /// A restart after rotation never reported healthy
    #[error("Rotation of '{service_id}' timed out waiting for healthy restart after {timeout_secs}s")]
    RotationTimeout { service_id: String, timeout_secs: u64 },

    /// TLS is not enabled for the requested service
    #[error("TLS is not configured for service '{service_id}'")]
    NotConfigured { service_id: String },

    /// Optimistic concurrency check failed
    #[error("Version conflict on '{path}': expected {expected}, found {actual}")]
    Conflict { path: String, expected: u64, actual: u64 },

    /// Missing or unknown credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential lacks the capability for this operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encryption, decryption or key reconstruction failures
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Certificate generation or parsing failures
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Bounded waits that expired
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Network transport errors talking to a remote orchestrator
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a policy violation error
    pub fn policy<S: Into<String>>(message: S) -> Self {
        Self::PolicyViolation { message: message.into() }
    }

    /// Create an invalid validity window error
    pub fn validity<S: Into<String>>(message: S) -> Self {
        Self::InvalidValidityWindow { message: message.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a cryptographic error
    pub fn crypto<S: Into<String>>(message: S) -> Self {
        Self::Crypto(message.into())
    }

    /// Create a certificate error
    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::Certificate(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Wrap an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Wrap a JSON error with context
    pub fn serialization<S: Into<String>>(source: serde_json::Error, context: S) -> Self {
        Self::Serialization { source, context: context.into() }
    }

    /// Check if this error is transient and should be retried by the broker
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Sealed | Error::Transport(_) | Error::Timeout { .. })
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Sealed => "sealed",
            Error::NotInitialized => "not_initialized",
            Error::AlreadyInitialized => "already_initialized",
            Error::AlreadyBootstrapped => "already_bootstrapped",
            Error::NotFound { .. } => "not_found",
            Error::PolicyViolation { .. } => "policy_violation",
            Error::InvalidValidityWindow { .. } => "invalid_validity_window",
            Error::DependencyFailed { .. } => "dependency_failed",
            Error::RotationTimeout { .. } => "rotation_timeout",
            Error::NotConfigured { .. } => "not_configured",
            Error::Conflict { .. } => "conflict",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Validation(_) => "validation_error",
            Error::Config(_) => "config_error",
            Error::Crypto(_) => "crypto_error",
            Error::Certificate(_) => "certificate_error",
            Error::Timeout { .. } => "timeout",
            Error::Transport(_) => "transport_error",
            Error::Io { .. } => "io_error",
            Error::Serialization { .. } => "serialization_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Sealed => 503,
            Error::NotInitialized => 503,
            Error::AlreadyInitialized => 409,
            Error::AlreadyBootstrapped => 409,
            Error::NotFound { .. } => 404,
            Error::PolicyViolation { .. } => 422,
            Error::InvalidValidityWindow { .. } => 422,
            Error::DependencyFailed { .. } => 424,
            Error::RotationTimeout { .. } => 504,
            Error::NotConfigured { .. } => 404,
            Error::Conflict { .. } => 409,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::Validation(_) => 400,
            Error::Config(_) => 500,
            Error::Crypto(_) => 500,
            Error::Certificate(_) => 500,
            Error::Timeout { .. } => 504,
            Error::Transport(_) => 502,
            Error::Io { .. } => 500,
            Error::Serialization { .. } => 400,
            Error::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::io(error, "I/O operation failed")
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error, "JSON serialization failed")
    }
}

impl From<rcgen::Error> for Error {
    fn from(error: rcgen::Error) -> Self {
        Self::certificate(error.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Sealed.is_retryable());
        assert!(Error::transport("connection refused").is_retryable());
        assert!(Error::timeout("fetch", 1000).is_retryable());
        assert!(!Error::not_found("path", "svc-a").is_retryable());
        assert!(!Error::policy("ttl too long").is_retryable());
        assert!(!Error::validity("root shorter than intermediate").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Sealed.status_code(), 503);
        assert_eq!(Error::not_found("path", "x").status_code(), 404);
        assert_eq!(Error::policy("x").status_code(), 422);
        assert_eq!(Error::AlreadyInitialized.status_code(), 409);
        assert_eq!(Error::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
    }

    #[test]
    fn test_error_display() {
        let err = Error::DependencyFailed {
            service_id: "pgbouncer".into(),
            failed: vec!["postgres".into()],
        };
        assert_eq!(
            err.to_string(),
            "Service 'pgbouncer' blocked by failed dependencies: postgres"
        );

        let err = Error::Conflict { path: "svc-a".into(), expected: 2, actual: 3 };
        assert!(err.to_string().contains("expected 2, found 3"));
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_error.into();
        assert!(matches!(err, Error::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_error.into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
