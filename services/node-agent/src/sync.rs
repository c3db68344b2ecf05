//! State transfer to another host.
//!
//! Mirrors the workload asset directory and then the checkpoint directory to the
//! same absolute paths on the target host with `rsync --delete`, one
//! directory at a time. A failed transfer stops the sequence; whatever the
//! earlier transfers copied stays on the target.

use std::path::PathBuf;
use std::sync::Arc;

use migrant_command::{CommandError, CommandRunner, Invocation};
use tracing::info;

/// Sync utility configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sync binary.
    pub bin: String,
    /// Remote login user.
    pub user: String,
    /// Directories to mirror, in transfer order.
    pub dirs: Vec<PathBuf>,
}

/// Transfers workload state to another host.
pub struct StateSync {
    config: SyncConfig,
    runner: Arc<dyn CommandRunner>,
}

impl StateSync {
    pub fn new(config: SyncConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Command lines that mirror every directory to `target`.
    pub fn invocations(&self, target: &str) -> Vec<Invocation> {
        self.config
            .dirs
            .iter()
            .map(|dir| {
                let path = dir.to_string_lossy();
                let path = path.trim_end_matches('/');
                Invocation::new(&self.config.bin).args([
                    "-az".to_string(),
                    "--delete".to_string(),
                    format!("{path}/"),
                    format!("{}@{}:{}", self.config.user, target, path),
                ])
            })
            .collect()
    }

    /// Mirror every directory to `target`, stopping at the first failure.
    pub async fn sync_to(&self, target: &str) -> Result<(), CommandError> {
        for invocation in self.invocations(target) {
            info!(command = %invocation, "Transferring directory");
            self.runner.run(&invocation).await?;
        }
        Ok(())
    }
}
