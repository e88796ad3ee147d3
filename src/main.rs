use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vaultkeeper::{
    api::start_api_server,
    observability::{init_observability, log_config_info},
    seal::SealState,
    startup::ServiceManifest,
    AppConfig, Error, Orchestrator, Result, APP_NAME, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    // This must happen before any config is read from environment
    if let Err(e) = dotenvy::dotenv() {
        // Only warn if the error is NOT "file not found"
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let config = AppConfig::from_env()?;
    init_observability(&config.observability)?;

    info!(app_name = APP_NAME, version = VERSION, "Starting vaultkeeper orchestrator");
    log_config_info(&config);

    let orchestrator = Orchestrator::from_config(config.clone()).await?;
    match orchestrator.auto_unseal().await {
        Ok(SealState::Unsealed) => info!("store unsealed from local key backup"),
        Ok(SealState::Uninitialized) => warn!("seal is not initialized; run `vaultkeeper-cli init`"),
        Ok(state) => info!(state = %state, "waiting for operators to present unseal shares"),
        Err(e) => error!(error = %e, "auto-unseal failed; falling back to manual unseal"),
    }

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to install CTRL+C signal handler");
            }
            info!("Shutdown signal received");
            cancel.cancel();
        })
    };

    let supervisor = tokio::spawn(supervise_restarts(orchestrator.clone(), cancel.clone()));
    let startup = tokio::spawn(run_startup(orchestrator.clone(), cancel.clone()));
    let scheduler = tokio::spawn(orchestrator.scheduler().clone().run(config.rotation.interval(), cancel.clone()));

    let api_cancel = cancel.clone();
    let api_result = start_api_server(orchestrator.clone(), async move { api_cancel.cancelled().await }).await;
    if let Err(e) = &api_result {
        error!(error = %e, "API server terminated with error");
    }

    cancel.cancel();
    shutdown.abort();
    for (name, task) in [("startup", startup), ("scheduler", scheduler), ("supervisor", supervisor)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task panicked");
        }
    }

    if orchestrator.seal_manager().is_unsealed() {
        if let Err(e) = orchestrator.seal(vaultkeeper::audit::SYSTEM_ACTOR).await {
            warn!(error = %e, "failed to seal on shutdown");
        }
    }

    info!("vaultkeeper shutdown completed");
    api_result
}

/// Wait for the store to be unsealed, then release services in dependency order.
async fn run_startup(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    let seal = orchestrator.seal_manager();
    let seal_config = &orchestrator.config().seal;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = seal.wait_until_unsealed(seal_config.unseal_wait(), seal_config.poll_interval()) => {
                match outcome {
                    Ok(()) => break,
                    Err(_) => info!(state = %seal.state(), "still waiting for the store to be unsealed"),
                }
            }
        }
    }

    let report = orchestrator.coordinator().run(cancel).await;
    for error in report.dependency_errors() {
        if let Error::DependencyFailed { service_id, failed } = &error {
            error!(service_id = %service_id, failed = ?failed, "service will not start");
        }
    }
}

/// Run each service's restart command when the coordinator asks for a
/// restart, and acknowledge once the command exits.
async fn supervise_restarts(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    let mut restarts = orchestrator.coordinator().subscribe_restarts();
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            received = restarts.recv() => match received {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "restart supervisor lagged behind");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };

        let Some((program, args)) = restart_command(orchestrator.manifest(), &request.service_id) else {
            info!(service_id = %request.service_id, "no restart command configured; relying on the service to reload");
            request.ack.complete(Ok(()));
            continue;
        };
        info!(service_id = %request.service_id, reason = %request.reason, program = %program, "restarting service");
        let outcome = match tokio::process::Command::new(&program).args(&args).status().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                warn!(service_id = %request.service_id, code = ?status.code(), "restart command failed");
                Err(format!("restart command exited with {}", status))
            }
            Err(e) => {
                error!(service_id = %request.service_id, error = %e, "failed to launch restart command");
                Err(format!("failed to launch restart command: {}", e))
            }
        };
        request.ack.complete(outcome);
    }
}

fn restart_command(manifest: &ServiceManifest, service_id: &str) -> Option<(String, Vec<String>)> {
    let command = &manifest.get(service_id)?.restart_command;
    let (program, args) = command.split_first()?;
    Some((program.clone(), args.to_vec()))
}
