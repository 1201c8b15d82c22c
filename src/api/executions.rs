/// Execution REST API endpoints
///
/// Read an execution, cancel it, and resolve approval gates.

use crate::{
    api::{ApiResult, AppState},
    execution::Execution,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

/// Request body for rejecting an approval gate
#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/nodes/{node_id}/approve", post(approve_node))
        .route("/api/executions/{id}/nodes/{node_id}/reject", post(reject_node))
}

/// GET /api/executions/{id}
async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Execution> {
    Ok(Json(state.engine.get_execution(&id).await?))
}

/// POST /api/executions/{id}/cancel
///
/// Only pending executions and executions parked on an approval can be cancelled.
async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Execution> {
    let execution = state.engine.cancel_execution(&id).await?;
    tracing::info!("🛑 Cancelled execution {}", id);
    Ok(Json(execution))
}

/// POST /api/executions/{id}/nodes/{node_id}/approve
async fn approve_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> ApiResult<Execution> {
    Ok(Json(state.engine.approve_node(&id, &node_id).await?))
}

/// POST /api/executions/{id}/nodes/{node_id}/reject
/// Body: { "reason": "..." }
async fn reject_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
    payload: Option<Json<RejectRequest>>,
) -> ApiResult<Execution> {
    let reason = payload
        .and_then(|Json(request)| request.reason)
        .unwrap_or_else(|| "Rejected".to_string());
    Ok(Json(state.engine.reject_node(&id, &node_id, &reason).await?))
}
