//! Workload lifecycle on one host.
//!
//! The agent owns at most one [`WorkloadHandle`]. Operations are
//! deliberately permissive: a checkpoint without a running workload or a
//! restore over an existing one is logged as an anomaly and attempted
//! anyway. Callers are expected to serialize operations against one agent;
//! the handle itself sits behind a mutex so concurrent calls stay
//! memory-safe, but their business-level ordering is not guarded.
//!
//! Launches (fresh start and restore) follow a grace-period pattern: the
//! runtime command is raced against a fixed window. A failure inside the
//! window fails the call; a process still running when the window closes
//! is reported as started. A failure after that point is only logged.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use migrant_command::CommandError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::runtime::{LaunchMode, ProcessKiller, WorkloadProcess, WorkloadRuntime};
use crate::sync::StateSync;

/// Default grace window for launches.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1700);

/// Default runtime state directory, removed by reset.
pub const DEFAULT_RUN_STATE_DIR: &str = "/run/runc";

/// Errors from agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The runtime reported a definite failure inside the grace window.
    #[error("launch failed: {0}")]
    LaunchFailed(#[source] CommandError),

    #[error("checkpoint failed: {0}")]
    CheckpointFailed(#[source] CommandError),

    #[error("sync failed: {0}")]
    SyncFailed(#[source] CommandError),

    /// Missing or invalid request parameter.
    #[error("{0}")]
    BadRequest(String),

    /// Killing the workload failed. Logged by reset, never returned to callers.
    #[error("kill failed: {0}")]
    KillFailed(#[source] std::io::Error),
}

/// Reference to the workload process this agent launched.
#[derive(Debug)]
pub struct WorkloadHandle {
    /// Launch counter, increasing per judged-successful launch.
    pub generation: u64,
    pub mode: LaunchMode,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    killer: ProcessKiller,
}

/// Read-only view of the handle.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl From<Option<&WorkloadHandle>> for WorkloadStatus {
    fn from(handle: Option<&WorkloadHandle>) -> Self {
        match handle {
            Some(h) => Self {
                running: true,
                generation: Some(h.generation),
                mode: Some(h.mode.to_string()),
                pid: h.pid,
                started_at: Some(h.started_at),
            },
            None => Self {
                running: false,
                generation: None,
                mode: None,
                pid: None,
                started_at: None,
            },
        }
    }
}

/// Node agent.
pub struct NodeAgent {
    runtime: Arc<dyn WorkloadRuntime>,
    sync: StateSync,
    grace_period: Duration,
    run_state_dir: PathBuf,
    handle: Mutex<Option<WorkloadHandle>>,
    generation: AtomicU64,
}

impl NodeAgent {
    /// Create an agent with the default grace period and run-state directory.
    pub fn new(runtime: Arc<dyn WorkloadRuntime>, sync: StateSync) -> Self {
        Self {
            runtime,
            sync,
            grace_period: DEFAULT_GRACE_PERIOD,
            run_state_dir: PathBuf::from(DEFAULT_RUN_STATE_DIR),
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_run_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_state_dir = dir.into();
        self
    }

    /// Launch the workload with no prior state.
    pub async fn start_fresh(&self) -> Result<(), AgentError> {
        info!("Starting initial run");
        self.launch(LaunchMode::Fresh).await
    }

    /// Resume the workload from local checkpoint data.
    pub async fn restore(&self) -> Result<(), AgentError> {
        info!("Starting restore");
        self.launch(LaunchMode::Restore).await
    }

    /// Freeze the workload to disk.
    ///
    /// The handle is cleared once the runtime command returns, whatever its result.
    pub async fn checkpoint(&self) -> Result<(), AgentError> {
        if self.handle.lock().await.is_none() {
            warn!("Checkpoint requested with no running workload, attempting anyway");
        }

        info!("Starting checkpoint");
        let result = self.runtime.checkpoint().await;
        let previous = self.handle.lock().await.take();
        let generation = previous.as_ref().map(|h| h.generation);

        match result {
            Ok(()) => {
                info!(generation = ?generation, "Finished checkpoint successfully");
                Ok(())
            }
            Err(e) => {
                error!(generation = ?generation, error = %e, "Checkpoint failed");
                Err(AgentError::CheckpointFailed(e))
            }
        }
    }

    /// Transfer workload assets and checkpoint data to `target`.
    pub async fn sync_state(&self, target: &str) -> Result<(), AgentError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(AgentError::BadRequest("no target specified".to_string()));
        }

        info!(target = %target, "Starting state sync");
        self.sync.sync_to(target).await.map_err(|e| {
            error!(target = %target, error = %e, "State sync failed");
            AgentError::SyncFailed(e)
        })?;
        info!(target = %target, "Finished state sync");
        Ok(())
    }

    /// Kill the workload if one is tracked and wipe the run-state directory.
    ///
    /// Never fails: every problem is logged.
    pub async fn reset(&self) {
        let previous = self.handle.lock().await.take();

        if let Some(handle) = previous {
            info!(generation = handle.generation, pid = ?handle.pid, "Killing workload");
            if let Err(e) = handle.killer.kill().await {
                let err = AgentError::KillFailed(e);
                warn!(generation = handle.generation, error = %err, "Failed to kill workload");
            }
        }

        match tokio::fs::remove_dir_all(&self.run_state_dir).await {
            Ok(()) => info!(dir = %self.run_state_dir.display(), "Removed run-state directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.run_state_dir.display(), "No run-state directory to remove")
            }
            Err(e) => warn!(
                dir = %self.run_state_dir.display(),
                error = %e,
                "Failed to remove run-state directory"
            ),
        }
    }

    /// Current handle view.
    pub async fn status(&self) -> WorkloadStatus {
        WorkloadStatus::from(self.handle.lock().await.as_ref())
    }

    async fn launch(&self, mode: LaunchMode) -> Result<(), AgentError> {
        if let Some(existing) = self.handle.lock().await.as_ref() {
            warn!(
                mode = %mode,
                existing_generation = existing.generation,
                existing_pid = ?existing.pid,
                "Workload already tracked, previous process may be leaked"
            );
        }

        let WorkloadProcess {
            pid,
            mut exit,
            killer,
        } = self.runtime.spawn(mode).await.map_err(|e| {
            error!(mode = %mode, error = %e, "Failed to launch workload");
            AgentError::LaunchFailed(e)
        })?;

        match tokio::time::timeout(self.grace_period, &mut exit).await {
            Ok(Ok(Err(e))) => {
                error!(mode = %mode, error = %e, "Workload failed within grace period");
                return Err(AgentError::LaunchFailed(e));
            }
            Ok(Ok(Ok(()))) => {
                info!(mode = %mode, "Workload command exited cleanly within grace period");
            }
            Ok(Err(_)) => {
                warn!(mode = %mode, "Workload supervisor went away before reporting");
            }
            Err(_) => {
                tokio::spawn(watch_late_exit(mode, pid, exit));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.handle.lock().await = Some(WorkloadHandle {
            generation,
            mode,
            pid,
            started_at: Utc::now(),
            killer,
        });

        info!(mode = %mode, generation, pid = ?pid, "Workload started successfully");
        Ok(())
    }
}

/// Log the outcome of a workload that outlived its grace window.
///
/// The original caller has already been told the launch succeeded.
async fn watch_late_exit(
    mode: LaunchMode,
    pid: Option<u32>,
    exit: oneshot::Receiver<Result<(), CommandError>>,
) {
    match exit.await {
        Ok(Ok(())) => info!(mode = %mode, pid = ?pid, "Workload process exited"),
        Ok(Err(e)) => warn!(
            mode = %mode,
            pid = ?pid,
            error = %e,
            "Workload process failed after grace period"
        ),
        Err(_) => debug!(mode = %mode, pid = ?pid, "Workload supervisor dropped"),
    }
}
