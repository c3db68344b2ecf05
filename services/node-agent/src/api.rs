//! HTTP API for the node agent.
//!
//! Every lifecycle operation is a `POST` with no body. Failures are returned
//! as plain text carrying the underlying command diagnostic.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::agent::{AgentError, NodeAgent, WorkloadStatus};

/// Create the agent router.
pub fn create_router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route("/run", post(start_fresh))
        .route("/checkpoint", post(checkpoint))
        .route("/restore", post(restore))
        .route("/sync", post(sync_state))
        .route("/reset", post(reset))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "Agent operation failed");
        } else {
            warn!(error = %self, "Rejected agent request");
        }

        (status, self.to_string()).into_response()
    }
}

async fn start_fresh(State(agent): State<Arc<NodeAgent>>) -> Result<StatusCode, AgentError> {
    agent.start_fresh().await?;
    Ok(StatusCode::OK)
}

async fn checkpoint(State(agent): State<Arc<NodeAgent>>) -> Result<StatusCode, AgentError> {
    agent.checkpoint().await?;
    Ok(StatusCode::OK)
}

async fn restore(State(agent): State<Arc<NodeAgent>>) -> Result<StatusCode, AgentError> {
    agent.restore().await?;
    Ok(StatusCode::OK)
}

/// Query parameters for a state sync.
#[derive(Debug, Deserialize)]
pub struct SyncParams {
    /// Host to transfer state to.
    pub target: Option<String>,
}

async fn sync_state(
    State(agent): State<Arc<NodeAgent>>,
    Query(params): Query<SyncParams>,
) -> Result<StatusCode, AgentError> {
    agent
        .sync_state(params.target.as_deref().unwrap_or_default())
        .await?;
    Ok(StatusCode::OK)
}

async fn reset(State(agent): State<Arc<NodeAgent>>) -> StatusCode {
    agent.reset().await;
    StatusCode::OK
}

async fn status(State(agent): State<Arc<NodeAgent>>) -> Json<WorkloadStatus> {
    Json(agent.status().await)
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "node-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
