//! migrant Node Agent
//!
//! Runs on each host and manages the lifecycle of the workload process
//! (checkpoint, restore, state transfer) on behalf of the orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use migrant_command::SystemRunner;
use migrant_node_agent::{
    api, config, runtime::RuncRuntime, MockRuntime, NodeAgent, StateSync, WorkloadRuntime,
};
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

    info!("Starting migrant node agent");
    info!(
        listen_addr = %config.listen_addr,
        workdir = %config.workdir.display(),
        runtime = %config.runtime.bin,
        grace_period_ms = config.grace_period.as_millis() as u64,
        "Configuration loaded"
    );

    // Runtime commands resolve config.json and checkpoint paths relative to this.
    if let Err(e) = std::env::set_current_dir(&config.workdir) {
        error!(
            workdir = %config.workdir.display(),
            error = %e,
            "Failed to enter workload directory"
        );
        return Err(e).context("failed to enter workload directory");
    }

    let runner = Arc::new(SystemRunner::new());

    let runtime: Arc<dyn WorkloadRuntime> = if config.dev_mode {
        warn!("Dev mode: using mock runtime");
        Arc::new(MockRuntime::new())
    } else {
        Arc::new(RuncRuntime::new(config.runtime.clone(), runner.clone()))
    };

    let agent = NodeAgent::new(runtime, StateSync::new(config.sync_config(), runner))
        .with_grace_period(config.grace_period)
        .with_run_state_dir(&config.run_state_dir);

    let app = api::create_router(Arc::new(agent));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!("Node agent shutdown complete");
    Ok(())
}
