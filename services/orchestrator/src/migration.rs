//! The migration protocol.
//!
//! A migrate request for a target host walks a linear sequence of steps:
//!
//! ```text
//! cold start:      start-fresh(target) → redirect(target) → promote(target)
//! live migration:  checkpoint(source) → sync-state(source → target)
//!                  → redirect(target) → restore(target) → promote(target)
//! ```
//!
//! Every step is attempted once. The first failure aborts the sequence and
//! is returned as-is; nothing already done is undone. The authoritative flag
//! only moves in the final promote, so after a failure the registry still
//! names the previous authority even when its workload is already
//! checkpointed. `reset_all` is the operator's way out of that state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use migrant_networking::{NetworkError, TrafficRedirector};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::agent_client::{AgentCallError, AgentClient, AgentOp};
use crate::registry::{HostRecord, Registry};

/// Named protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    StartFresh,
    Checkpoint,
    SyncState,
    Redirect,
    Restore,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationStep::StartFresh => "start-fresh",
            MigrationStep::Checkpoint => "checkpoint",
            MigrationStep::SyncState => "sync-state",
            MigrationStep::Redirect => "redirect",
            MigrationStep::Restore => "restore",
        })
    }
}

/// Cause of a failed step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Agent(#[from] AgentCallError),

    #[error(transparent)]
    Redirect(#[from] NetworkError),
}

/// Errors from the orchestrator operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Missing or blank target.
    #[error("{0}")]
    BadRequest(String),

    /// Another migration holds the migration lock.
    #[error("a migration is already in progress")]
    InProgress,

    /// A protocol step failed; later steps were not attempted.
    #[error("{step} on {host} failed: {source}")]
    Step {
        step: MigrationStep,
        host: String,
        #[source]
        source: StepError,
    },
}

impl MigrationError {
    /// The failed step, if the protocol got that far.
    pub fn step(&self) -> Option<MigrationStep> {
        match self {
            MigrationError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// What a successful migrate request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Target was already authoritative; nothing was called.
    AlreadyAuthoritative,
    /// No host was authoritative; the workload was started fresh on the target.
    ColdStart,
    /// The workload moved from `from` to the target.
    Migrated { from: String },
}

/// Drives migrations and owns the host registry.
pub struct Orchestrator {
    registry: Mutex<Registry>,
    agents: Arc<dyn AgentClient>,
    redirector: Arc<dyn TrafficRedirector>,
    migration_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(agents: Arc<dyn AgentClient>, redirector: Arc<dyn TrafficRedirector>) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            agents,
            redirector,
            migration_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry snapshot in first-seen order.
    pub fn hosts(&self) -> Vec<HostRecord> {
        self.registry().records()
    }

    /// Move the workload to `target`.
    ///
    /// Concurrent requests are rejected with [`MigrationError::InProgress`].
    pub async fn migrate(&self, target: &str) -> Result<MigrationOutcome, MigrationError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(MigrationError::BadRequest("no target specified".to_string()));
        }

        let _guard = self
            .migration_lock
            .try_lock()
            .map_err(|_| MigrationError::InProgress)?;

        let (record, authority) = {
            let mut registry = self.registry();
            let record = registry.get_or_insert(target);
            (record, registry.authoritative().cloned())
        };

        if record.authoritative {
            info!(target = %target, "Target already authoritative, nothing to do");
            return Ok(MigrationOutcome::AlreadyAuthoritative);
        }

        let result = match authority {
            None => self.cold_start(target).await,
            Some(source) => self.live_migrate(&source.address, target).await,
        };

        match &result {
            Ok(outcome) => info!(target = %target, outcome = ?outcome, "Migration finished"),
            Err(e) => error!(target = %target, error = %e, "Migration aborted"),
        }
        result
    }

    async fn cold_start(&self, target: &str) -> Result<MigrationOutcome, MigrationError> {
        info!(target = %target, "No authoritative host, starting workload fresh");

        self.agent_step(MigrationStep::StartFresh, target, AgentOp::StartFresh)
            .await?;
        self.redirect_step(target).await?;
        self.registry().promote(target);

        Ok(MigrationOutcome::ColdStart)
    }

    async fn live_migrate(
        &self,
        source: &str,
        target: &str,
    ) -> Result<MigrationOutcome, MigrationError> {
        info!(source = %source, target = %target, "Starting live migration");

        self.agent_step(MigrationStep::Checkpoint, source, AgentOp::Checkpoint)
            .await?;
        self.agent_step(
            MigrationStep::SyncState,
            source,
            AgentOp::SyncState {
                target: target.to_string(),
            },
        )
        .await?;
        self.redirect_step(target).await?;
        self.agent_step(MigrationStep::Restore, target, AgentOp::Restore)
            .await?;
        self.registry().promote(target);

        Ok(MigrationOutcome::Migrated {
            from: source.to_string(),
        })
    }

    async fn agent_step(
        &self,
        step: MigrationStep,
        host: &str,
        op: AgentOp,
    ) -> Result<(), MigrationError> {
        info!(step = %step, host = %host, "Migration step starting");
        self.agents
            .call(host, &op)
            .await
            .map_err(|e| MigrationError::Step {
                step,
                host: host.to_string(),
                source: e.into(),
            })
    }

    async fn redirect_step(&self, target: &str) -> Result<(), MigrationError> {
        info!(step = %MigrationStep::Redirect, host = %target, "Migration step starting");
        self.redirector
            .redirect_to(target)
            .await
            .map_err(|e| MigrationError::Step {
                step: MigrationStep::Redirect,
                host: target.to_string(),
                source: e.into(),
            })
    }

    /// Reset every known agent and clear all authoritative flags.
    ///
    /// Agent failures are logged and skipped.
    pub async fn reset_all(&self) {
        let addresses = self.registry().addresses();
        info!(hosts = addresses.len(), "Resetting all hosts");

        for address in &addresses {
            if let Err(e) = self.agents.call(address, &AgentOp::Reset).await {
                warn!(host = %address, error = %e, "Failed to reset host");
            }
        }

        self.registry().clear_authority();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use migrant_networking::{IptablesRedirector, RedirectConfig};
    use migrant_testing::RecordingRunner;

    /// Records agent calls and fails the ones scripted to fail.
    #[derive(Default)]
    struct FakeAgents {
        calls: Mutex<Vec<(String, AgentOp)>>,
        failures: Mutex<Vec<(String, AgentOp)>>,
    }

    impl FakeAgents {
        fn fail(&self, host: &str, op: AgentOp) {
            self.failures.lock().unwrap().push((host.to_string(), op));
        }

        fn calls(&self) -> Vec<(String, AgentOp)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentClient for FakeAgents {
        async fn call(&self, host: &str, op: &AgentOp) -> Result<(), AgentCallError> {
            let call = (host.to_string(), op.clone());
            self.calls.lock().unwrap().push(call.clone());

            if self.failures.lock().unwrap().contains(&call) {
                return Err(AgentCallError::Status {
                    host: host.to_string(),
                    status: 500,
                    body: format!("{op} failed: exit status: 1"),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        agents: Arc<FakeAgents>,
        runner: Arc<RecordingRunner>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let agents = Arc::new(FakeAgents::default());
        let runner = Arc::new(RecordingRunner::new());
        let redirector = Arc::new(IptablesRedirector::new(
            RedirectConfig::new("45.55.31.66".parse().unwrap()),
            runner.clone(),
        ));
        let orchestrator = Orchestrator::new(agents.clone(), redirector);
        Fixture {
            agents,
            runner,
            orchestrator,
        }
    }

    fn redirect_targets(runner: &RecordingRunner) -> Vec<String> {
        runner
            .command_lines()
            .into_iter()
            .filter(|line| line.contains("-A PREROUTING"))
            .map(|line| line.rsplit(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    fn sync_to(target: &str) -> AgentOp {
        AgentOp::SyncState {
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_cold_start() {
        let f = fixture();

        let outcome = f.orchestrator.migrate("10.0.0.2").await.unwrap();

        assert_eq!(outcome, MigrationOutcome::ColdStart);
        assert_eq!(
            f.agents.calls(),
            [("10.0.0.2".to_string(), AgentOp::StartFresh)]
        );
        assert_eq!(redirect_targets(&f.runner), ["10.0.0.2:27960"]);
        assert_eq!(
            f.orchestrator.hosts(),
            [HostRecord {
                address: "10.0.0.2".to_string(),
                authoritative: true
            }]
        );
    }

    #[tokio::test]
    async fn test_cold_start_failure_leaves_target_unpromoted() {
        let f = fixture();
        f.agents.fail("10.0.0.2", AgentOp::StartFresh);

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert_eq!(err.step(), Some(MigrationStep::StartFresh));
        assert!(f.runner.calls().is_empty());
        assert!(!f.orchestrator.hosts()[0].authoritative);
    }

    #[tokio::test]
    async fn test_live_migration_order() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();

        let outcome = f.orchestrator.migrate("10.0.0.2").await.unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                from: "10.0.0.1".to_string()
            }
        );
        assert_eq!(
            f.agents.calls()[1..],
            [
                ("10.0.0.1".to_string(), AgentOp::Checkpoint),
                ("10.0.0.1".to_string(), sync_to("10.0.0.2")),
                ("10.0.0.2".to_string(), AgentOp::Restore),
            ]
        );
        assert_eq!(
            redirect_targets(&f.runner),
            ["10.0.0.1:27960", "10.0.0.2:27960"]
        );

        let hosts = f.orchestrator.hosts();
        assert!(!hosts[0].authoritative);
        assert!(hosts[1].authoritative);
    }

    #[tokio::test]
    async fn test_migrate_to_authority_is_noop() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        let calls_before = f.agents.calls().len();
        let commands_before = f.runner.calls().len();

        let outcome = f.orchestrator.migrate("10.0.0.1").await.unwrap();

        assert_eq!(outcome, MigrationOutcome::AlreadyAuthoritative);
        assert_eq!(f.agents.calls().len(), calls_before);
        assert_eq!(f.runner.calls().len(), commands_before);
        assert_eq!(f.orchestrator.hosts().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_and_keeps_authority() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        f.agents.fail("10.0.0.1", AgentOp::Checkpoint);
        let commands_before = f.runner.calls().len();

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert_eq!(err.step(), Some(MigrationStep::Checkpoint));
        assert!(err.to_string().starts_with("checkpoint on 10.0.0.1 failed"));
        assert!(err.to_string().contains("checkpoint failed"));
        assert_eq!(
            f.agents.calls()[1..],
            [("10.0.0.1".to_string(), AgentOp::Checkpoint)]
        );
        assert_eq!(f.runner.calls().len(), commands_before);

        let hosts = f.orchestrator.hosts();
        assert_eq!(hosts[0].address, "10.0.0.1");
        assert!(hosts[0].authoritative);
        assert!(!hosts[1].authoritative);
    }

    #[tokio::test]
    async fn test_sync_failure_skips_redirect_and_restore() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        f.agents.fail("10.0.0.1", sync_to("10.0.0.2"));

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert_eq!(err.step(), Some(MigrationStep::SyncState));
        assert_eq!(redirect_targets(&f.runner), ["10.0.0.1:27960"]);
        assert!(!f
            .agents
            .calls()
            .contains(&("10.0.0.2".to_string(), AgentOp::Restore)));
        assert!(f.orchestrator.hosts()[0].authoritative);
    }

    #[tokio::test]
    async fn test_redirect_failure_skips_restore() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        f.runner.fail_when("--to-source", "iptables: Resource temporarily unavailable.");

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert_eq!(err.step(), Some(MigrationStep::Redirect));
        assert_eq!(f.agents.calls().len(), 3);
        assert!(f.orchestrator.hosts()[0].authoritative);
    }

    #[tokio::test]
    async fn test_restore_failure_keeps_old_authority() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        f.agents.fail("10.0.0.2", AgentOp::Restore);

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert_eq!(err.step(), Some(MigrationStep::Restore));
        let hosts = f.orchestrator.hosts();
        assert!(hosts[0].authoritative);
        assert!(!hosts[1].authoritative);

        // Retrying reruns the whole live sequence against the old authority.
        f.agents.failures.lock().unwrap().clear();
        let outcome = f.orchestrator.migrate("10.0.0.2").await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { .. }));
    }

    #[tokio::test]
    async fn test_blank_target_rejected() {
        let f = fixture();

        let err = f.orchestrator.migrate(" ").await.unwrap_err();

        assert!(matches!(err, MigrationError::BadRequest(_)));
        assert!(f.orchestrator.hosts().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_migration_rejected() {
        let f = fixture();
        let _held = f.orchestrator.migration_lock.lock().await;

        let err = f.orchestrator.migrate("10.0.0.2").await.unwrap_err();

        assert!(matches!(err, MigrationError::InProgress));
        assert!(f.agents.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset_all() {
        let f = fixture();
        f.orchestrator.migrate("10.0.0.1").await.unwrap();
        f.orchestrator.migrate("10.0.0.2").await.unwrap();
        f.agents.fail("10.0.0.1", AgentOp::Reset);

        f.orchestrator.reset_all().await;

        let resets: Vec<_> = f
            .agents
            .calls()
            .into_iter()
            .filter(|(_, op)| *op == AgentOp::Reset)
            .map(|(host, _)| host)
            .collect();
        assert_eq!(resets, ["10.0.0.1", "10.0.0.2"]);
        assert!(f.orchestrator.hosts().iter().all(|h| !h.authoritative));
    }
}
