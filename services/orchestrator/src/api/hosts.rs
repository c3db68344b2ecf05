//! Registry and migration endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::migration::MigrationOutcome;
use crate::registry::HostRecord;
use crate::state::AppState;

/// Create registry and migration routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_hosts))
        .route("/reset", post(reset_all))
        .route("/migrate", post(migrate))
}

/// Query parameters for a migrate request.
#[derive(Debug, Deserialize)]
pub struct MigrateParams {
    /// Host that should serve the workload.
    pub target: Option<String>,
}

async fn list_hosts(State(state): State<AppState>) -> Json<Vec<HostRecord>> {
    Json(state.orchestrator().hosts())
}

async fn reset_all(State(state): State<AppState>) -> StatusCode {
    state.orchestrator().reset_all().await;
    StatusCode::OK
}

async fn migrate(
    State(state): State<AppState>,
    Query(params): Query<MigrateParams>,
) -> Result<Json<MigrationOutcome>, ApiError> {
    let target = params.target.unwrap_or_default();
    let outcome = state.orchestrator().migrate(&target).await?;
    Ok(Json(outcome))
}
