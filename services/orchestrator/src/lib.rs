//! migrant orchestrator library.
//!
//! This crate primarily ships an `orchestrator` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod agent_client;
pub mod api;
pub mod config;
pub mod migration;
pub mod registry;
pub mod state;

pub use agent_client::{AgentCallError, AgentClient, AgentOp, HttpAgentClient};
pub use migration::{MigrationError, MigrationOutcome, MigrationStep, Orchestrator};
pub use registry::{HostRecord, Registry};
