//! Output formatting for CLI commands: JSON, YAML, or a plain table.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::audit::AuditEntry;
use crate::startup::NodeSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
}

/// Print `data` in `format`; `table` renders the plain-text form.
pub fn emit<T: Serialize>(data: &T, format: OutputFormat, table: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(data),
        OutputFormat::Yaml => print_yaml(data),
        OutputFormat::Table => {
            println!("{}", table(data));
            Ok(())
        }
    }
}

pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    println!("{}", to_json(data)?);
    Ok(())
}

pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{}", yaml);
    Ok(())
}

fn to_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string_pretty(data).context("Failed to serialize to JSON")
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn table_header(columns: &[(&str, usize)]) -> String {
    let mut header = String::new();
    for (name, width) in columns {
        header.push_str(&format!("{:<width$} ", name, width = width));
    }
    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    format!("{}\n{}", header.trim_end(), "-".repeat(total_width.saturating_sub(1)))
}

pub fn render_services(nodes: &[NodeSnapshot]) -> String {
    let mut out = table_header(&[("SERVICE", 24), ("STATUS", 24), ("DEPENDS ON", 30)]);
    for node in nodes {
        let status = serde_json::to_value(node.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        out.push_str(&format!(
            "\n{:<24} {:<24} {}",
            truncate(&node.service_id, 24),
            status,
            truncate(&node.depends_on.join(","), 30)
        ));
    }
    out
}

pub fn render_audit(entries: &[AuditEntry]) -> String {
    let mut out = table_header(&[("TIMESTAMP", 25), ("ACTION", 22), ("RESOURCE", 20), ("ACTOR", 28), ("OK", 3)]);
    for entry in entries {
        out.push_str(&format!(
            "\n{:<25} {:<22} {:<20} {:<28} {}",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            truncate(&entry.action, 22),
            truncate(&entry.resource, 20),
            truncate(&entry.actor, 28),
            if entry.success { "yes" } else { "no" }
        ));
    }
    out
}
