use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RotationConfig;

/// What a tracked item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Credential,
    Certificate,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Credential => "credential",
            ItemKind::Certificate => "certificate",
        })
    }
}

/// Per-item rotation state. A failed rollout goes back to `Due`, never `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Fresh,
    Due,
    Rotating,
    RolledOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub service_id: String,
    pub kind: ItemKind,
    pub message: String,
}

/// Result of checking one item against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub due: bool,
    pub alert: Option<AlertSeverity>,
}

/// Age thresholds. Rotation kicks in first; the alert fires only if an item
/// keeps aging past the lower threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub rotate_before: Duration,
    pub alert_before: Duration,
    pub password_lifetime: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::from(&RotationConfig::default())
    }
}

impl From<&RotationConfig> for RotationPolicy {
    fn from(config: &RotationConfig) -> Self {
        Self {
            rotate_before: config.rotate_before(),
            alert_before: config.alert_before(),
            password_lifetime: config.password_lifetime(),
        }
    }
}

impl RotationPolicy {
    /// Nominal expiry of a password written at `created_at`. A lifetime past
    /// the representable range never expires.
    pub fn password_expiry(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at.checked_add_signed(to_chrono(self.password_lifetime)).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `None` expiry means there is nothing valid in place (for example a
    /// revoked certificate) and the item is due immediately.
    pub fn assess(&self, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Assessment {
        let Some(expires_at) = expires_at else {
            return Assessment { due: true, alert: Some(AlertSeverity::Warning) };
        };

        let remaining = expires_at - now;
        let due = remaining < to_chrono(self.rotate_before);
        let alert = if remaining <= chrono::Duration::zero() {
            Some(AlertSeverity::Critical)
        } else if remaining < to_chrono(self.alert_before) {
            Some(AlertSeverity::Warning)
        } else {
            None
        };
        Assessment { due, alert }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
