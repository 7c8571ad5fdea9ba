#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use toolbridged::config::{Args, ServerConfig};
use toolbridged::metrics::{start_metrics_server, HealthState};
use toolbridged::run_with_shutdown;
use toolbridged::server::ServerState;
use toolbridged::session::JwtVerifier;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.jwt_secret.len() < 32 {
        anyhow::bail!("configuration error: jwt_secret must be at least 32 bytes");
    }
    let verifier = Arc::new(JwtVerifier::new(args.jwt_secret.as_bytes()));
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone(), verifier));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        let registry = state.registry.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state, registry).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    drop(shutdown_tx);

    match server.await {
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
