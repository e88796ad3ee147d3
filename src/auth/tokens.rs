use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::secrets::SecretString;
use crate::storage::{StateDir, TOKENS_FILE};

const ADMIN_PREFIX: &str = "vk_admin_";
const SERVICE_PREFIX: &str = "vk_svc_";
const TOKEN_SECRET_LEN: usize = 40;

/// Capability carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Admin,
    Service(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Admin => f.write_str("admin"),
            Scope::Service(id) => write!(f, "service:{}", id),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Scope::Admin),
            other => other
                .strip_prefix("service:")
                .filter(|id| !id.is_empty())
                .map(|id| Scope::Service(id.to_string()))
                .ok_or_else(|| Error::validation(format!("unknown token scope '{}'", other))),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Authenticated caller, attached to the request by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Short non-secret identifier derived from the token hash
    pub token_id: String,
    pub scope: Scope,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.scope == Scope::Admin
    }

    /// Name recorded as `actor` in the audit log
    pub fn actor(&self) -> String {
        format!("{}#{}", self.scope, self.token_id)
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("scope '{}' cannot perform administrative operations", self.scope)))
        }
    }

    /// Admin, or the service token for exactly `service_id`.
    pub fn require_service(&self, service_id: &str) -> Result<()> {
        match &self.scope {
            Scope::Admin => Ok(()),
            Scope::Service(id) if id == service_id => Ok(()),
            Scope::Service(id) => {
                Err(Error::Forbidden(format!("token for '{}' cannot access '{}'", id, service_id)))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    hash: String,
    scope: Scope,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: Vec<TokenRecord>,
}

/// Bearer tokens, persisted as SHA-256 hashes only.
///
/// One admin token exists at a time. Each service holds at most one token;
/// issuing a new one invalidates the previous.
#[derive(Debug)]
pub struct TokenStore {
    state_dir: Arc<StateDir>,
    by_hash: RwLock<HashMap<String, TokenRecord>>,
}

impl TokenStore {
    pub async fn open(state_dir: Arc<StateDir>) -> Result<Self> {
        let file: TokenFile = state_dir.read_json(TOKENS_FILE).await?.unwrap_or_default();
        let by_hash = file.tokens.into_iter().map(|t| (t.hash.clone(), t)).collect();
        Ok(Self { state_dir, by_hash: RwLock::new(by_hash) })
    }

    /// Replace the admin token. The token store keeps only its hash; the
    /// plaintext is returned to the caller, which writes it to the key backup.
    pub async fn create_admin_token(&self) -> Result<SecretString> {
        let token = generate_token(ADMIN_PREFIX);
        self.replace(Scope::Admin, &token).await?;
        info!("admin token created");
        Ok(token)
    }

    /// Issue the token a service uses to fetch its own credentials.
    pub async fn issue_service_token(&self, service_id: &str) -> Result<SecretString> {
        crate::secrets::validate_path(service_id)?;
        let token = generate_token(SERVICE_PREFIX);
        self.replace(Scope::Service(service_id.to_string()), &token).await?;
        info!(service_id, "service token issued");
        Ok(token)
    }

    pub async fn revoke_service_token(&self, service_id: &str) -> Result<bool> {
        let scope = Scope::Service(service_id.to_string());
        let mut tokens = self.by_hash.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.scope != scope);
        let removed = tokens.len() != before;
        if removed {
            persist(&self.state_dir, &tokens).await?;
        }
        Ok(removed)
    }

    pub async fn has_admin_token(&self) -> bool {
        self.by_hash.read().await.values().any(|r| r.scope == Scope::Admin)
    }

    /// Resolve a raw `Authorization` header value.
    pub async fn authenticate(&self, header: &str) -> Result<AuthContext> {
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

        let hash = hash_token(token);
        match self.by_hash.read().await.get(&hash) {
            Some(record) => Ok(AuthContext { token_id: hash[..12].to_string(), scope: record.scope.clone() }),
            None => {
                warn!(token_id = &hash[..12], "unknown bearer token");
                Err(Error::Unauthorized("invalid token".to_string()))
            }
        }
    }

    async fn replace(&self, scope: Scope, token: &SecretString) -> Result<()> {
        let mut tokens = self.by_hash.write().await;
        tokens.retain(|_, record| record.scope != scope);
        let hash = hash_token(token.expose_secret());
        tokens.insert(hash.clone(), TokenRecord { hash, scope, created_at: Utc::now() });
        persist(&self.state_dir, &tokens).await
    }
}

async fn persist(state_dir: &StateDir, tokens: &HashMap<String, TokenRecord>) -> Result<()> {
    let mut records: Vec<TokenRecord> = tokens.values().cloned().collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.hash.cmp(&b.hash)));
    state_dir.write_private_json(TOKENS_FILE, &TokenFile { tokens: records }).await
}

fn generate_token(prefix: &str) -> SecretString {
    let secret = Alphanumeric.sample_string(&mut rand::thread_rng(), TOKEN_SECRET_LEN);
    SecretString::new(format!("{}{}", prefix, secret))
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> TokenStore {
        TokenStore::open(Arc::new(StateDir::open(dir.path()).await.unwrap())).await.unwrap()
    }

    fn bearer(token: &SecretString) -> String {
        format!("Bearer {}", token.expose_secret())
    }

    #[tokio::test]
    async fn test_admin_and_service_scopes() {
        let dir = TempDir::new().unwrap();
        let tokens = store(&dir).await;

        let admin = tokens.create_admin_token().await.unwrap();
        assert!(admin.expose_secret().starts_with(ADMIN_PREFIX));
        let ctx = tokens.authenticate(&bearer(&admin)).await.unwrap();
        assert!(ctx.is_admin());
        assert!(ctx.require_service("anything").is_ok());

        let svc = tokens.issue_service_token("svc-a").await.unwrap();
        let ctx = tokens.authenticate(&bearer(&svc)).await.unwrap();
        assert_eq!(ctx.scope, Scope::Service("svc-a".into()));
        assert!(ctx.require_service("svc-a").is_ok());
        assert!(matches!(ctx.require_service("svc-b"), Err(Error::Forbidden(_))));
        assert!(matches!(ctx.require_admin(), Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_reissue_invalidates_previous_and_persists_hashes_only() {
        let dir = TempDir::new().unwrap();
        let tokens = store(&dir).await;

        let first = tokens.issue_service_token("svc-a").await.unwrap();
        let second = tokens.issue_service_token("svc-a").await.unwrap();
        assert!(tokens.authenticate(&bearer(&first)).await.is_err());
        assert!(tokens.authenticate(&bearer(&second)).await.is_ok());

        let raw = std::fs::read_to_string(dir.path().join(TOKENS_FILE)).unwrap();
        assert!(!raw.contains(second.expose_secret()));
        assert!(raw.contains(&hash_token(second.expose_secret())));

        let reopened = store(&dir).await;
        assert!(reopened.authenticate(&bearer(&second)).await.is_ok());
        assert!(reopened.revoke_service_token("svc-a").await.unwrap());
        assert!(reopened.authenticate(&bearer(&second)).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_headers_rejected() {
        let dir = TempDir::new().unwrap();
        let tokens = store(&dir).await;
        for header in ["", "Bearer ", "Basic abc", "Bearer vk_admin_nope"] {
            assert!(matches!(tokens.authenticate(header).await, Err(Error::Unauthorized(_))));
        }
    }

    #[test]
    fn test_scope_round_trip() {
        assert_eq!("admin".parse::<Scope>().unwrap(), Scope::Admin);
        assert_eq!("service:db".parse::<Scope>().unwrap().to_string(), "service:db");
        assert!("service:".parse::<Scope>().is_err());
        assert!("root".parse::<Scope>().is_err());
    }
}
