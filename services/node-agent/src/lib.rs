//! migrant Node Agent Library
//!
//! The node agent runs on each host and owns the lifecycle of the single
//! workload process there: fresh start, checkpoint, restore, state sync to
//! another host, and reset. The orchestrator drives it over HTTP.
//!
//! ## Modules
//!
//! - `agent`: workload handle and lifecycle operations
//! - `runtime`: container runtime commands (`runc`) and a mock
//! - `sync`: directory transfer to the next host
//! - `api`: HTTP routes

pub mod agent;
pub mod api;
pub mod config;
pub mod runtime;
pub mod sync;

// Re-export commonly used types
pub use agent::{AgentError, NodeAgent, WorkloadStatus};
pub use runtime::{LaunchMode, MockLaunch, MockRuntime, RuncRuntime, WorkloadRuntime};
pub use sync::{StateSync, SyncConfig};
