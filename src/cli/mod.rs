//! # Command Line Interface
//!
//! `vaultkeeper-cli`: operator commands (init, unseal, status, rotate, audit)
//! and the launch-wrapper form of the startup gate (`wait`), all thin wrappers
//! over [`client::ApiClient`].

pub mod client;
pub mod output;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::pki::TlsBundle;
use crate::seal::{KeyBackup, SealState};
use crate::secrets::SecretString;
use client::{ApiClient, ClientConfig};
use output::{emit, render_audit, render_services, OutputFormat};

const DEFAULT_ADDR: &str = "http://127.0.0.1:8200";

#[derive(Parser)]
#[command(name = "vaultkeeper-cli")]
#[command(about = "Operator and launch-wrapper tooling for the vaultkeeper orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API address (falls back to VAULTKEEPER_ADDR)
    #[arg(long, global = true)]
    pub addr: Option<String>,

    /// Bearer token (falls back to VAULTKEEPER_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Path to a file containing the bearer token
    #[arg(long, global = true)]
    pub token_file: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    pub timeout: u64,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the seal; prints the unseal shares and admin token once
    Init {
        #[arg(long, default_value_t = 5)]
        shares: u8,
        #[arg(long, default_value_t = 3)]
        threshold: u8,
    },

    /// Present an unseal share, or every share from a key backup file
    Unseal {
        share: Option<String>,
        #[arg(long, conflicts_with = "share")]
        keys_file: Option<PathBuf>,
    },

    /// Seal status; `--full` shows services, rotation state and alerts (admin)
    Status {
        #[arg(long)]
        full: bool,
    },

    /// Block until the service may start, then optionally exec a command
    Wait {
        service_id: String,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
        /// Command to run once released; its exit code is propagated
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Fetch the service's credential record
    Fetch {
        service_id: String,
        /// Print only the current version
        #[arg(long)]
        version: bool,
    },

    /// Fetch the service's TLS material
    Tls {
        service_id: String,
        /// Write cert.pem, key.pem and ca.pem into this directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Rotate a service's credential and certificate now (admin)
    Rotate { service_id: String },

    /// Show recent audit log entries (admin)
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    initialise_logging(cli.verbose);

    let client = create_http_client(&cli)?;
    let format = cli.output;

    match cli.command {
        Commands::Init { shares, threshold } => {
            let init = client.init(shares, threshold).await?;
            output::print_json(&init)?;
            eprintln!(
                "Store these {} shares separately. Losing more than {} of them makes the store unrecoverable.",
                init.shares.len(),
                (init.shares.len() as u8).saturating_sub(init.threshold)
            );
        }

        Commands::Unseal { share, keys_file } => {
            let status = match (share, keys_file) {
                (Some(share), _) => client.unseal(&share).await?,
                (None, Some(path)) => unseal_from_backup(&client, &path).await?,
                (None, None) => anyhow::bail!("provide a share or --keys-file"),
            };
            emit(&status, format, |s| format!("{} ({}/{} shares presented)", s.state, s.progress, s.threshold))?;
        }

        Commands::Status { full: false } => {
            let status = client.seal_status().await?;
            emit(&status, format, |s| {
                format!("state: {}\nshares: {}\nthreshold: {}\nprogress: {}", s.state, s.shares, s.threshold, s.progress)
            })?;
        }

        Commands::Status { full: true } => {
            let status = client.status().await?;
            emit(&status, format, |s| {
                let mut out = format!("seal: {}\npki bootstrapped: {}\n", s.seal.state, s.pki_bootstrapped);
                out.push_str(&render_services(&s.services));
                for alert in &s.alerts {
                    out.push_str(&format!(
                        "\n[{}] {} {}: {}",
                        alert.severity.as_str(),
                        alert.service_id,
                        alert.kind,
                        alert.message
                    ));
                }
                out
            })?;
        }

        Commands::Wait { service_id, timeout_secs, command } => {
            let gate = client.wait_until_ready(&service_id, Duration::from_secs(timeout_secs)).await?;
            if !gate.ready {
                anyhow::bail!("'{}' was not released within {}s (status: {:?})", service_id, timeout_secs, gate.status);
            }
            info!(service_id = %service_id, "startup gate released");
            if let Some((program, args)) = command.split_first() {
                let status = tokio::process::Command::new(program)
                    .args(args)
                    .status()
                    .await
                    .with_context(|| format!("failed to launch '{}'", program))?;
                std::process::exit(status.code().unwrap_or(1));
            }
        }

        Commands::Fetch { service_id, version: true } => {
            println!("{}", client.credentials_version(&service_id).await?);
        }

        Commands::Fetch { service_id, version: false } => {
            let record = client.credentials(&service_id).await?;
            // Table output never prints the password
            emit(&record, format, |r| {
                let mut out = format!("service: {}\nusername: {}\nversion: {}\ntls: {}", r.service_id, r.username, r.version, r.tls_enabled);
                for (key, value) in &r.extra_fields {
                    out.push_str(&format!("\n{}: {}", key, value));
                }
                out
            })?;
        }

        Commands::Tls { service_id, out_dir } => {
            let bundle = client.tls(&service_id).await?;
            match out_dir {
                Some(dir) => {
                    write_tls_bundle(&bundle, &dir).await?;
                    println!("wrote TLS material for '{}' (serial {}) to {}", service_id, bundle.serial_number, dir.display());
                }
                None => output::print_json(&bundle)?,
            }
        }

        Commands::Rotate { service_id } => {
            let rotation = client.force_rotate(&service_id).await?;
            emit(&rotation, format, |r| {
                format!(
                    "rotated {}: version {:?}, serial {:?}, restarted [{}]",
                    r.service_id,
                    r.new_version,
                    r.new_serial,
                    r.restarted.join(", ")
                )
            })?;
        }

        Commands::Audit { limit } => {
            let entries = client.audit(limit).await?;
            emit(&entries, format, |e| render_audit(e))?;
        }
    }

    Ok(())
}

async fn unseal_from_backup(client: &ApiClient, path: &Path) -> anyhow::Result<crate::seal::SealStatus> {
    let backup = KeyBackup::load(path)
        .await?
        .with_context(|| format!("no key backup at {}", path.display()))?;
    let mut status = client.seal_status().await?;
    for share in backup.share_secrets() {
        if status.state == SealState::Unsealed {
            break;
        }
        status = client.unseal(share.expose_secret()).await?;
    }
    Ok(status)
}

async fn write_tls_bundle(bundle: &TlsBundle, dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
    tokio::fs::write(dir.join("cert.pem"), &bundle.certificate_pem).await?;
    tokio::fs::write(dir.join("ca.pem"), &bundle.ca_bundle_pem).await?;
    write_private(&dir.join("key.pem"), &bundle.private_key_pem).await
}

async fn write_private(path: &Path, contents: &SecretString) -> anyhow::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.with_context(|| format!("opening {}", path.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents.expose_secret().as_bytes()).await?;
    Ok(())
}

/// Create HTTP client with resolved address and token
fn create_http_client(cli: &Cli) -> anyhow::Result<ApiClient> {
    let base_url = cli
        .addr
        .clone()
        .or_else(|| std::env::var("VAULTKEEPER_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let token = resolve_token(cli.token.clone(), cli.token_file.as_deref())?;

    let config = ClientConfig { base_url, token, timeout: cli.timeout, verbose: cli.verbose };
    Ok(ApiClient::new(config)?)
}

/// Token precedence: flag, token file, `VAULTKEEPER_TOKEN`.
fn resolve_token(token: Option<String>, token_file: Option<&Path>) -> anyhow::Result<Option<String>> {
    if let Some(token) = token {
        return Ok(Some(token));
    }
    if let Some(path) = token_file {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading token file {}", path.display()))?;
        return Ok(Some(contents.trim().to_string()));
    }
    Ok(std::env::var("VAULTKEEPER_TOKEN").ok().filter(|t| !t.is_empty()))
}

fn initialise_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Already set when embedded in tests
    let _ = tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_env_filter(filter).with_writer(std::io::stderr).finish(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_wait_collects_trailing_command() {
        let cli = Cli::parse_from(["vaultkeeper-cli", "wait", "pgbouncer", "--timeout-secs", "5", "--", "pgbouncer", "-v"]);
        match cli.command {
            Commands::Wait { service_id, timeout_secs, command } => {
                assert_eq!(service_id, "pgbouncer");
                assert_eq!(timeout_secs, 5);
                assert_eq!(command, vec!["pgbouncer", "-v"]);
            }
            _ => panic!("expected wait"),
        }
    }

    #[test]
    fn test_token_flag_wins_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "from-file\n").unwrap();
        assert_eq!(resolve_token(Some("flag".into()), Some(&file)).unwrap().as_deref(), Some("flag"));
        assert_eq!(resolve_token(None, Some(&file)).unwrap().as_deref(), Some("from-file"));
    }
}
