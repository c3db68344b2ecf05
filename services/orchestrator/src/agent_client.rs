//! Outbound calls to node agents.
//!
//! Each agent operation is a `POST http://<host>:<agent-port>/<op>` that
//! waits for the full response. There is no timeout: checkpoint and sync
//! take as long as they take.

use std::fmt;
use std::net::Ipv6Addr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

/// An operation on a node agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOp {
    StartFresh,
    Checkpoint,
    Restore,
    SyncState { target: String },
    Reset,
}

impl AgentOp {
    /// Route of the operation on the agent.
    pub fn path(&self) -> &'static str {
        match self {
            AgentOp::StartFresh => "/run",
            AgentOp::Checkpoint => "/checkpoint",
            AgentOp::Restore => "/restore",
            AgentOp::SyncState { .. } => "/sync",
            AgentOp::Reset => "/reset",
        }
    }

    /// Query parameters of the operation.
    pub fn query(&self) -> Vec<(&'static str, &str)> {
        match self {
            AgentOp::SyncState { target } => vec![("target", target.as_str())],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for AgentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentOp::StartFresh => f.write_str("start-fresh"),
            AgentOp::Checkpoint => f.write_str("checkpoint"),
            AgentOp::Restore => f.write_str("restore"),
            AgentOp::SyncState { target } => write!(f, "sync-state({target})"),
            AgentOp::Reset => f.write_str("reset"),
        }
    }
}

/// Errors from calling an agent.
#[derive(Debug, Error)]
pub enum AgentCallError {
    /// The agent could not be reached or the exchange broke off.
    #[error("request to agent {host} failed: {source}")]
    Transport {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// The agent answered with a non-success status.
    #[error("agent {host} returned {status}: {body}")]
    Status {
        host: String,
        status: u16,
        body: String,
    },
}

/// Client for node agent operations.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Invoke `op` on the agent at `host` and wait for its response.
    async fn call(&self, host: &str, op: &AgentOp) -> Result<(), AgentCallError>;
}

/// HTTP implementation of [`AgentClient`].
pub struct HttpAgentClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpAgentClient {
    /// Create a client reaching every agent on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }

    /// URL of `op` on `host`.
    pub fn url(&self, host: &str, op: &AgentOp) -> String {
        let authority = match host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{host}]:{}", self.port),
            Err(_) => format!("{host}:{}", self.port),
        };
        format!("http://{authority}{}", op.path())
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn call(&self, host: &str, op: &AgentOp) -> Result<(), AgentCallError> {
        let url = self.url(host, op);
        debug!(host = %host, op = %op, url = %url, "Calling agent");

        let response = self
            .client
            .post(&url)
            .query(&op.query())
            .send()
            .await
            .map_err(|source| AgentCallError::Transport {
                host: host.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(host = %host, op = %op, status = %status, body = %body, "Agent call failed");
            return Err(AgentCallError::Status {
                host: host.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let client = HttpAgentClient::new(8080);
        assert_eq!(
            client.url("10.0.0.1", &AgentOp::Checkpoint),
            "http://10.0.0.1:8080/checkpoint"
        );
        assert_eq!(
            client.url("fd00::1", &AgentOp::Restore),
            "http://[fd00::1]:8080/restore"
        );
    }

    #[test]
    fn test_sync_query() {
        let op = AgentOp::SyncState {
            target: "10.0.0.2".to_string(),
        };
        assert_eq!(op.path(), "/sync");
        assert_eq!(op.query(), [("target", "10.0.0.2")]);
        assert!(AgentOp::Reset.query().is_empty());
    }
}
