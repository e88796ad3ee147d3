//! Audit log of administrative and secret-access events
//!
//! Records are appended as JSON lines to `audit.jsonl` in the state directory.
//! Entries name the resource and the actor, never a secret value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::Result;
use crate::storage::{StateDir, AUDIT_FILE};

/// Actor recorded for actions the daemon takes on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub resource: String,
    pub actor: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: &str, resource: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            resource: resource.into(),
            actor: actor.into(),
            success: true,
            detail: None,
        }
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.success = false;
        self.detail = Some(detail.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Mark the entry with the outcome of `result`.
    pub fn outcome<T>(self, result: &Result<T>) -> Self {
        match result {
            Ok(_) => self,
            Err(err) => self.failed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    state_dir: Arc<StateDir>,
}

impl AuditLog {
    pub fn new(state_dir: Arc<StateDir>) -> Self {
        Self { state_dir }
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        self.state_dir.append_line(AUDIT_FILE, &line).await
    }

    /// Append an entry; a write failure is logged and otherwise ignored so
    /// the audited operation still reports its own outcome.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.append(&entry).await {
            warn!(action = %entry.action, resource = %entry.resource, error = %err, "failed to write audit entry");
        }
    }

    /// The most recent `limit` entries, oldest first. Unparseable lines are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let lines = self.state_dir.read_lines(AUDIT_FILE).await?;
        let mut entries: Vec<AuditEntry> =
            lines.iter().rev().filter_map(|line| serde_json::from_str(line).ok()).take(limit).collect();
        entries.reverse();
        Ok(entries)
    }
}
