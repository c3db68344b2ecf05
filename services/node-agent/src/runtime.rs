//! Workload runtime interface, `runc` implementation and mock.
//!
//! The runtime abstracts the container runtime commands:
//! - launching the workload fresh or from a checkpoint
//! - freezing it to disk
//!
//! A launched workload is a long-running child process. The runtime hands
//! back a [`WorkloadProcess`]: a receiver that resolves when the process
//! exits, and a [`ProcessKiller`] wired to the task that owns the child.

use std::future::pending;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migrant_command::{combine_output, CommandError, CommandRunner, Invocation};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// How a workload is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// No prior state.
    Fresh,
    /// Resume from checkpoint data on local disk.
    Restore,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Fresh => f.write_str("fresh"),
            LaunchMode::Restore => f.write_str("restore"),
        }
    }
}

/// Request sent to the task owning a child process; answered with the kill result.
pub type KillRequest = oneshot::Sender<io::Result<()>>;

/// Kills a launched workload process.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    tx: mpsc::Sender<KillRequest>,
}

impl ProcessKiller {
    /// Create a killer and the request stream the process owner listens on.
    pub fn channel() -> (Self, mpsc::Receiver<KillRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Kill the process.
    ///
    /// A process that already exited has nothing to kill and reports success.
    pub async fn kill(&self) -> io::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(reply_tx).await.is_err() {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }
}

/// A launched workload process.
#[derive(Debug)]
pub struct WorkloadProcess {
    /// OS process id, when the runtime knows it.
    pub pid: Option<u32>,
    /// Resolves once with the process outcome.
    pub exit: oneshot::Receiver<Result<(), CommandError>>,
    /// Kill switch for the process.
    pub killer: ProcessKiller,
}

/// Workload runtime interface.
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Launch the workload. Returns as soon as the process is spawned.
    async fn spawn(&self, mode: LaunchMode) -> Result<WorkloadProcess, CommandError>;

    /// Freeze the running workload to durable state, stopping it.
    async fn checkpoint(&self) -> Result<(), CommandError>;
}

// =============================================================================
// runc
// =============================================================================

/// Configuration for the container runtime commands.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Runtime binary.
    pub bin: String,
    /// Container id passed to every runtime command, if any.
    pub container_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bin: "runc".to_string(),
            container_id: None,
        }
    }
}

impl RuntimeConfig {
    /// Command line for launching in `mode`.
    ///
    /// Without a container id a fresh launch is the bare runtime invocation,
    /// which makes the runtime pick up `config.json` from the working directory.
    pub fn launch_invocation(&self, mode: LaunchMode) -> Invocation {
        let invocation = Invocation::new(&self.bin);
        match (mode, &self.container_id) {
            (LaunchMode::Fresh, None) => invocation,
            (LaunchMode::Fresh, Some(id)) => invocation.args(["run", id.as_str()]),
            (LaunchMode::Restore, None) => invocation.arg("restore"),
            (LaunchMode::Restore, Some(id)) => invocation.args(["restore", id.as_str()]),
        }
    }

    /// Command line for checkpointing.
    pub fn checkpoint_invocation(&self) -> Invocation {
        Invocation::new(&self.bin)
            .arg("checkpoint")
            .args(self.container_id.iter().cloned())
    }
}

/// Runtime driving a `runc`-compatible binary.
pub struct RuncRuntime {
    config: RuntimeConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RuncRuntime {
    pub fn new(config: RuntimeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }
}

#[async_trait]
impl WorkloadRuntime for RuncRuntime {
    async fn spawn(&self, mode: LaunchMode) -> Result<WorkloadProcess, CommandError> {
        let invocation = self.config.launch_invocation(mode);
        info!(command = %invocation, mode = %mode, "Launching workload");

        let mut child = invocation
            .to_command()
            .spawn()
            .map_err(|e| CommandError::spawn(&invocation, e))?;

        let pid = child.id();
        let (killer, mut kill_rx) = ProcessKiller::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let stdout = tokio::spawn(read_tail(child.stdout.take(), OUTPUT_TAIL_LIMIT));
        let stderr = tokio::spawn(read_tail(child.stderr.take(), OUTPUT_TAIL_LIMIT));

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(reply) = kill_rx.recv() => {
                        let _ = reply.send(child.kill().await);
                    }
                }
            };

            let stdout = stdout.await.unwrap_or_default();
            let stderr = stderr.await.unwrap_or_default();
            let output = combine_output(&stdout, &stderr);

            let result = match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(CommandError::failed(&invocation, status, output)),
                Err(e) => Err(CommandError::spawn(&invocation, e)),
            };
            debug!(command = %invocation, ok = result.is_ok(), "Workload process exited");
            let _ = exit_tx.send(result);
        });

        Ok(WorkloadProcess {
            pid,
            exit: exit_rx,
            killer,
        })
    }

    async fn checkpoint(&self) -> Result<(), CommandError> {
        let invocation = self.config.checkpoint_invocation();
        info!(command = %invocation, "Checkpointing workload");
        self.runner.run(&invocation).await.map(|_| ())
    }
}

/// Bytes of each output stream kept for the failure diagnostic.
///
/// The workload writes to these pipes for as long as it runs, so only the
/// tail is retained.
pub const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

/// Drain `pipe` to EOF, keeping at most the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut pipe) = pipe else {
        return tail;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

// =============================================================================
// Mock
// =============================================================================

/// Scripted outcome of a mock launch.
#[derive(Debug, Clone)]
pub enum MockLaunch {
    /// Process keeps running until killed.
    RunForever,
    /// Process exits cleanly after the delay.
    ExitOk(Duration),
    /// Process fails after the delay with the given output.
    Fail(Duration, String),
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    fresh: Mutex<MockLaunch>,
    restore: Mutex<MockLaunch>,
    checkpoint_failure: Mutex<Option<String>>,
    kill_failure: Arc<Mutex<Option<String>>>,
    launches: Mutex<Vec<LaunchMode>>,
    checkpoints: AtomicUsize,
    kills: Arc<AtomicUsize>,
    pid_counter: AtomicU32,
}

impl MockRuntime {
    /// Create a mock whose launches run until killed.
    pub fn new() -> Self {
        Self {
            fresh: Mutex::new(MockLaunch::RunForever),
            restore: Mutex::new(MockLaunch::RunForever),
            checkpoint_failure: Mutex::new(None),
            kill_failure: Arc::new(Mutex::new(None)),
            launches: Mutex::new(Vec::new()),
            checkpoints: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            pid_counter: AtomicU32::new(1000),
        }
    }

    /// Script the outcome of launches in `mode`.
    pub fn set_launch(&self, mode: LaunchMode, launch: MockLaunch) {
        let slot = match mode {
            LaunchMode::Fresh => &self.fresh,
            LaunchMode::Restore => &self.restore,
        };
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = launch;
    }

    /// Make every checkpoint fail with `output`.
    pub fn fail_checkpoints(&self, output: &str) {
        *self
            .checkpoint_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(output.to_string());
    }

    /// Make every kill request fail with `message`; the process keeps running.
    pub fn fail_kills(&self, message: &str) {
        *self.kill_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    /// Launch modes requested so far.
    pub fn launches(&self) -> Vec<LaunchMode> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadRuntime for MockRuntime {
    async fn spawn(&self, mode: LaunchMode) -> Result<WorkloadProcess, CommandError> {
        let launch = match mode {
            LaunchMode::Fresh => self.fresh.lock(),
            LaunchMode::Restore => self.restore.lock(),
        }
        .unwrap_or_else(|e| e.into_inner())
        .clone();

        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(mode);

        info!(mode = %mode, "[MOCK] Launching workload");

        let invocation = Invocation::new("mock-runtime").arg(mode.to_string());
        let pid = self.pid_counter.fetch_add(1, Ordering::SeqCst);
        let (killer, mut kill_rx) = ProcessKiller::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kills = Arc::clone(&self.kills);
        let kill_failure = Arc::clone(&self.kill_failure);

        tokio::spawn(async move {
            let outcome = async {
                match launch {
                    MockLaunch::RunForever => pending::<Result<(), CommandError>>().await,
                    MockLaunch::ExitOk(after) => {
                        tokio::time::sleep(after).await;
                        Ok(())
                    }
                    MockLaunch::Fail(after, output) => {
                        tokio::time::sleep(after).await;
                        Err(CommandError::Failed {
                            command: invocation.to_string(),
                            status: "exit status: 1".to_string(),
                            output,
                        })
                    }
                }
            };

            tokio::pin!(outcome);

            let result = loop {
                tokio::select! {
                    result = &mut outcome => break result,
                    Some(reply) = kill_rx.recv() => {
                        let failure = kill_failure
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        if let Some(message) = failure {
                            let _ = reply.send(Err(io::Error::new(
                                io::ErrorKind::PermissionDenied,
                                message,
                            )));
                            continue;
                        }

                        kills.fetch_add(1, Ordering::SeqCst);
                        let _ = reply.send(Ok(()));
                        break Err(CommandError::Failed {
                            command: invocation.to_string(),
                            status: "signal: 9 (SIGKILL)".to_string(),
                            output: String::new(),
                        });
                    }
                }
            };
            let _ = exit_tx.send(result);
        });

        Ok(WorkloadProcess {
            pid: Some(pid),
            exit: exit_rx,
            killer,
        })
    }

    async fn checkpoint(&self) -> Result<(), CommandError> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        info!("[MOCK] Checkpointing workload");

        let failure = self
            .checkpoint_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match failure {
            Some(output) => Err(CommandError::Failed {
                command: "mock-runtime checkpoint".to_string(),
                status: "exit status: 1".to_string(),
                output,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrant_command::SystemRunner;
    use migrant_testing::RecordingRunner;

    #[test]
    fn test_launch_invocation_without_container_id() {
        let config = RuntimeConfig::default();
        assert_eq!(config.launch_invocation(LaunchMode::Fresh).to_string(), "runc");
        assert_eq!(
            config.launch_invocation(LaunchMode::Restore).to_string(),
            "runc restore"
        );
        assert_eq!(config.checkpoint_invocation().to_string(), "runc checkpoint");
    }

    #[test]
    fn test_launch_invocation_with_container_id() {
        let config = RuntimeConfig {
            bin: "/usr/sbin/runc".to_string(),
            container_id: Some("quake".to_string()),
        };
        assert_eq!(
            config.launch_invocation(LaunchMode::Fresh).to_string(),
            "/usr/sbin/runc run quake"
        );
        assert_eq!(
            config.launch_invocation(LaunchMode::Restore).to_string(),
            "/usr/sbin/runc restore quake"
        );
        assert_eq!(
            config.checkpoint_invocation().to_string(),
            "/usr/sbin/runc checkpoint quake"
        );
    }

    #[tokio::test]
    async fn test_runc_checkpoint_uses_runner() {
        let runner = Arc::new(RecordingRunner::new());
        let runtime = RuncRuntime::new(RuntimeConfig::default(), runner.clone());

        runtime.checkpoint().await.unwrap();
        assert_eq!(runner.command_lines(), ["runc checkpoint"]);
    }

    #[tokio::test]
    async fn test_runc_spawn_reports_failure_output() {
        let config = RuntimeConfig {
            bin: "sh".to_string(),
            container_id: None,
        };
        // `sh restore` fails: there is no script named "restore".
        let runtime = RuncRuntime::new(config, Arc::new(SystemRunner::new()));

        let process = runtime.spawn(LaunchMode::Restore).await.unwrap();
        assert!(process.pid.is_some());

        let result = process.exit.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runc_spawn_missing_binary() {
        let config = RuntimeConfig {
            bin: "/nonexistent/runc".to_string(),
            container_id: None,
        };
        let runtime = RuncRuntime::new(config, Arc::new(SystemRunner::new()));

        let err = runtime.spawn(LaunchMode::Fresh).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_mock_kill() {
        let runtime = MockRuntime::new();
        let process = runtime.spawn(LaunchMode::Fresh).await.unwrap();

        process.killer.kill().await.unwrap();
        assert!(process.exit.await.unwrap().is_err());
        assert_eq!(runtime.kill_count(), 1);

        // Killing an exited process is a no-op.
        process.killer.kill().await.unwrap();
        assert_eq!(runtime.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let mut data = vec![b'x'; 3 * OUTPUT_TAIL_LIMIT];
        data.extend_from_slice(b"criu: restore failed");

        let tail = read_tail(Some(&data[..]), OUTPUT_TAIL_LIMIT).await;

        assert_eq!(tail.len(), OUTPUT_TAIL_LIMIT);
        assert!(tail.ends_with(b"criu: restore failed"));
        assert!(read_tail(None::<&[u8]>, OUTPUT_TAIL_LIMIT).await.is_empty());
    }

    #[tokio::test]
    async fn test_runc_spawn_bounds_captured_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("noisy-runc");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             head -c 1000000 /dev/zero | tr '\\0' x\n\
             echo 'criu: restore failed' >&2\n\
             exit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = RuntimeConfig {
            bin: script.to_string_lossy().into_owned(),
            container_id: None,
        };
        let runtime = RuncRuntime::new(config, Arc::new(SystemRunner::new()));

        let process = runtime.spawn(LaunchMode::Restore).await.unwrap();
        let err = process.exit.await.unwrap().unwrap_err();

        let output = err.output().unwrap();
        // Both streams are capped, plus the separator between them.
        assert!(output.len() <= 2 * OUTPUT_TAIL_LIMIT + 1, "{}", output.len());
        assert!(output.ends_with("criu: restore failed"));
    }

    #[tokio::test]
    async fn test_mock_failed_kill_keeps_process_running() {
        let runtime = MockRuntime::new();
        runtime.fail_kills("Operation not permitted");
        let mut process = runtime.spawn(LaunchMode::Fresh).await.unwrap();

        let err = process.killer.kill().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(runtime.kill_count(), 0);
        assert!(process.exit.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_scripted_failure() {
        let runtime = MockRuntime::new();
        runtime.set_launch(
            LaunchMode::Restore,
            MockLaunch::Fail(Duration::from_millis(10), "corrupt image".to_string()),
        );

        let process = runtime.spawn(LaunchMode::Restore).await.unwrap();
        let err = process.exit.await.unwrap().unwrap_err();
        assert_eq!(err.output(), Some("corrupt image"));
        assert_eq!(runtime.launches(), [LaunchMode::Restore]);
    }
}
