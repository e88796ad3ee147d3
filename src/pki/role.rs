use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::KeySize;
use crate::errors::{Error, Result};

/// Issuance policy for one service. Roles are the only way to obtain a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub service_id: String,
    /// Exact DNS names or IP addresses, or `*.suffix` wildcards
    pub allowed_common_names: Vec<String>,
    pub max_ttl: Duration,
    pub key_size: KeySize,
}

impl Role {
    pub fn new(
        service_id: impl Into<String>,
        allowed_common_names: Vec<String>,
        max_ttl: Duration,
        key_size_bits: u16,
    ) -> Result<Self> {
        let service_id = service_id.into();
        crate::secrets::validate_path(&service_id)?;

        if allowed_common_names.is_empty() {
            return Err(Error::policy(format!("role '{}' must allow at least one name", service_id)));
        }
        let allowed_common_names = allowed_common_names
            .into_iter()
            .map(|name| normalize_pattern(&name))
            .collect::<Result<Vec<_>>>()?;

        if max_ttl.is_zero() {
            return Err(Error::policy(format!("role '{}' max_ttl must be positive", service_id)));
        }

        Ok(Self { service_id, allowed_common_names, max_ttl, key_size: KeySize::try_from(key_size_bits)? })
    }

    /// True if `name` matches one of the allowed names. A wildcard `*.example`
    /// matches exactly one additional label.
    pub fn permits_name(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.allowed_common_names.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(suffix) => name
                .strip_suffix(suffix)
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
            None => *pattern == name,
        })
    }

    /// First non-wildcard allowed name, used when a request names no SANs.
    pub fn default_name(&self) -> Option<&str> {
        self.allowed_common_names.iter().map(String::as_str).find(|n| !n.starts_with("*."))
    }

    /// Check a request against this role. Never clamps.
    pub fn check(&self, requested_ttl: Duration, names: &[String]) -> Result<()> {
        if requested_ttl.is_zero() {
            return Err(Error::policy("requested ttl must be positive"));
        }
        if requested_ttl > self.max_ttl {
            return Err(Error::policy(format!(
                "requested ttl {}h exceeds max_ttl {}h for role '{}'",
                requested_ttl.as_secs() / 3600,
                self.max_ttl.as_secs() / 3600,
                self.service_id
            )));
        }
        if let Some(denied) = names.iter().find(|name| !self.permits_name(name)) {
            return Err(Error::policy(format!(
                "name '{}' is not allowed by role '{}'",
                denied, self.service_id
            )));
        }
        Ok(())
    }
}

fn normalize_pattern(name: &str) -> Result<String> {
    let name = name.trim().to_ascii_lowercase();
    if name.parse::<IpAddr>().is_ok() {
        return Ok(name);
    }

    let host = name.strip_prefix("*.").unwrap_or(&name);
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(name)
    } else {
        Err(Error::policy(format!("'{}' is not a valid DNS name, IP address or wildcard", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;

    fn db_role() -> Role {
        Role::new(
            "db",
            vec!["postgres".into(), "*.dev.local".into(), "127.0.0.1".into()],
            Duration::from_secs(8760 * HOUR),
            256,
        )
        .unwrap()
    }

    #[test]
    fn test_exact_and_wildcard_matching() {
        let role = db_role();
        assert!(role.permits_name("postgres"));
        assert!(role.permits_name("POSTGRES"));
        assert!(role.permits_name("pg.dev.local"));
        assert!(role.permits_name("127.0.0.1"));
        assert!(!role.permits_name("dev.local"));
        assert!(!role.permits_name("a.b.dev.local"));
        assert!(!role.permits_name("mysql"));
    }

    #[test]
    fn test_ttl_is_never_clamped() {
        let role = db_role();
        assert!(role.check(Duration::from_secs(8760 * HOUR), &["postgres".into()]).is_ok());
        let err = role.check(Duration::from_secs(17520 * HOUR), &["postgres".into()]).unwrap_err();
        assert!(matches!(err, Error::PolicyViolation { .. }));
        assert!(role.check(Duration::ZERO, &[]).is_err());
    }

    #[test]
    fn test_disallowed_name_rejected() {
        let err = db_role().check(Duration::from_secs(HOUR), &["evil.example.com".into()]).unwrap_err();
        assert!(err.to_string().contains("evil.example.com"));
    }

    #[test]
    fn test_role_validation() {
        assert!(Role::new("db", vec![], Duration::from_secs(HOUR), 256).is_err());
        assert!(Role::new("db", vec!["ok".into()], Duration::from_secs(HOUR), 1024).is_err());
        assert!(Role::new("db", vec!["bad name".into()], Duration::from_secs(HOUR), 256).is_err());
        assert!(Role::new("db", vec!["ok".into()], Duration::ZERO, 256).is_err());
        assert!(Role::new("../db", vec!["ok".into()], Duration::from_secs(HOUR), 256).is_err());
    }

    #[test]
    fn test_default_name_skips_wildcards() {
        let role =
            Role::new("redis", vec!["*.cache".into(), "redis-1".into()], Duration::from_secs(HOUR), 384)
                .unwrap();
        assert_eq!(role.default_name(), Some("redis-1"));
        assert_eq!(role.key_size, KeySize::P384);
    }
}
