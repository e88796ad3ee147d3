use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{Error, Result};
use crate::orchestrator::Orchestrator;

use super::routes::build_router;

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn start_api_server<F>(orchestrator: Arc<Orchestrator>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = orchestrator.config().server.bind_address();
    let addr: SocketAddr =
        bind.parse().map_err(|e| Error::config(format!("Invalid API address '{}': {}", bind, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::transport(format!("Failed to bind API server: {}", e)))?;

    info!(address = %addr, "Starting HTTP API server");
    serve(listener, orchestrator, shutdown).await?;
    info!("API server shutdown completed");
    Ok(())
}

/// Serve on an already bound listener.
pub async fn serve<F>(listener: TcpListener, orchestrator: Arc<Orchestrator>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(orchestrator);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::transport(format!("API server error: {}", e)))
}
