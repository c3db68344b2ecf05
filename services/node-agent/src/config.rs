//! Configuration for the node agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::agent::{DEFAULT_GRACE_PERIOD, DEFAULT_RUN_STATE_DIR};
use crate::runtime::RuntimeConfig;
use crate::sync::SyncConfig;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the agent API listens on.
    pub listen_addr: SocketAddr,

    /// Workload working directory; the agent changes into it at startup.
    pub workdir: PathBuf,

    /// Container runtime commands.
    pub runtime: RuntimeConfig,

    /// How long a launch may take to fail before it is assumed started.
    pub grace_period: Duration,

    /// Checkpoint data directory (synced second).
    pub checkpoint_dir: PathBuf,

    /// Workload asset directory (synced first).
    pub assets_dir: PathBuf,

    /// Runtime state directory, removed wholesale by reset.
    pub run_state_dir: PathBuf,

    /// Sync binary.
    pub sync_bin: String,

    /// Remote user for sync.
    pub sync_user: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Use the mock runtime instead of real runtime commands.
    pub dev_mode: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MIGRANT_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid MIGRANT_LISTEN_ADDR")?;

        let workdir = PathBuf::from(
            std::env::var("MIGRANT_WORKDIR").unwrap_or_else(|_| "/root/ioquake3".to_string()),
        );

        let runtime = RuntimeConfig {
            bin: std::env::var("MIGRANT_RUNTIME_BIN").unwrap_or_else(|_| "runc".to_string()),
            container_id: std::env::var("MIGRANT_CONTAINER_ID")
                .ok()
                .filter(|s| !s.is_empty()),
        };

        let grace_period = match std::env::var("MIGRANT_GRACE_PERIOD_MS") {
            Ok(ms) => Duration::from_millis(
                ms.parse()
                    .context("invalid MIGRANT_GRACE_PERIOD_MS")?,
            ),
            Err(_) => DEFAULT_GRACE_PERIOD,
        };

        let checkpoint_dir = std::env::var("MIGRANT_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workdir.join("checkpoint"));

        let assets_dir = std::env::var("MIGRANT_ASSETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workdir.join("q3a"));

        let run_state_dir = PathBuf::from(
            std::env::var("MIGRANT_RUN_STATE_DIR")
                .unwrap_or_else(|_| DEFAULT_RUN_STATE_DIR.to_string()),
        );

        let sync_bin = std::env::var("MIGRANT_SYNC_BIN").unwrap_or_else(|_| "rsync".to_string());
        let sync_user = std::env::var("MIGRANT_SYNC_USER").unwrap_or_else(|_| "root".to_string());

        let log_level = std::env::var("MIGRANT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("MIGRANT_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            workdir,
            runtime,
            grace_period,
            checkpoint_dir,
            assets_dir,
            run_state_dir,
            sync_bin,
            sync_user,
            log_level,
            dev_mode,
        })
    }

    /// Sync configuration: workload assets first, then checkpoint data.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            bin: self.sync_bin.clone(),
            user: self.sync_user.clone(),
            dirs: vec![self.assets_dir.clone(), self.checkpoint_dir.clone()],
        }
    }
}
