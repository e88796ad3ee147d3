//! Request and response bodies of the HTTP API.
//!
//! Types here are shared by the server and by the remote client, so every one
//! derives both `Serialize` and `Deserialize`. Secret fields are plain strings
//! on the wire; they only appear in responses a token is scoped to read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::pki::{CaHierarchy, KeySize, Role};
use crate::startup::ServiceStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitRequest {
    #[validate(range(min = 1))]
    pub shares: u8,
    #[validate(range(min = 1))]
    pub threshold: u8,
}

/// Returned once; neither the shares nor the admin token can be read again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub shares: Vec<String>,
    pub threshold: u8,
    pub admin_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealRequest {
    pub share: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResponse {
    pub service_id: String,
    pub ready: bool,
    pub status: Option<ServiceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub service_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PutCredentialsRequest {
    #[validate(length(min = 1, max = 128))]
    pub username: String,
    /// Generated when absent
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tls_enabled: Option<bool>,
    /// Optimistic concurrency guard; 0 means the path must not exist yet
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCredentialsResponse {
    pub service_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct BootstrapPkiRequest {
    #[validate(range(min = 1))]
    pub root_validity_hours: Option<u64>,
    #[validate(range(min = 1))]
    pub intermediate_validity_hours: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DefineRoleRequest {
    #[validate(length(min = 1, max = 128))]
    pub service_id: String,
    #[validate(length(min = 1))]
    pub allowed_common_names: Vec<String>,
    #[validate(range(min = 1))]
    pub max_ttl_hours: u64,
    #[serde(default)]
    pub key_size: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleResponse {
    pub service_id: String,
    pub allowed_common_names: Vec<String>,
    pub max_ttl_hours: u64,
    pub key_size: KeySize,
}

impl From<Role> for RoleResponse {
    fn from(role: Role) -> Self {
        Self {
            service_id: role.service_id,
            allowed_common_names: role.allowed_common_names,
            max_ttl_hours: role.max_ttl.as_secs() / 3600,
            key_size: role.key_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IssueRequest {
    #[validate(length(min = 1, max = 128))]
    pub service_id: String,
    /// Defaults to the role's max TTL
    #[serde(default)]
    pub ttl_hours: Option<u64>,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub serial_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaResponse {
    pub hierarchy: CaHierarchy,
    pub ca_bundle_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub service_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}
