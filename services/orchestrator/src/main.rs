//! migrant Orchestrator
//!
//! Keeps the registry of hosts, decides which one serves the workload, and
//! moves the workload between hosts by driving their node agents and
//! rewriting the NAT rules for the public endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use migrant_command::SystemRunner;
use migrant_networking::{IptablesRedirector, TrafficRedirector};
use migrant_orchestrator::{api, config, state::AppState, HttpAgentClient, Orchestrator};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MIGRANT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting migrant orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        agent_port = config.agent_port,
        public_addr = %config.redirect.public_addr,
        workload_port = config.redirect.port,
        protocol = %config.redirect.protocol,
        "Configuration loaded"
    );

    let redirector = Arc::new(IptablesRedirector::new(
        config.redirect.clone(),
        Arc::new(SystemRunner::new()),
    ));

    // The registry starts empty, so no rule can be pointing anywhere valid.
    redirector.flush().await;

    let orchestrator = Orchestrator::new(
        Arc::new(HttpAgentClient::new(config.agent_port)),
        redirector,
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let app = api::create_router(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if !server_handle.is_finished() {
        let shutdown_timeout = Duration::from_secs(10);
        if tokio::time::timeout(shutdown_timeout, server_handle).await.is_err() {
            warn!("HTTP server did not shut down in time");
        }
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
