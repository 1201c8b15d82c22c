/// Pipeline management REST API endpoints
///
/// CRUD over stored pipeline definitions, plus the pre-flight, test-run and
/// start-execution entry points. Saved pipelines take effect on the next engine
/// operation since the engine fetches them fresh every time.

use crate::{
    api::{ApiError, ApiResult, AppState},
    execution::{Execution, Trigger},
    pipeline::{Pipeline, PipelineStore},
    runtime::{validate, TestMode, TestRunReport, ValidationIssue},
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for pipeline creation/update operations
#[derive(Debug, Serialize)]
pub struct PipelineResponse {
    pub id: String,
    pub message: String,
}

/// Request body for pipeline creation and update
#[derive(Debug, Deserialize)]
pub struct SavePipelineRequest {
    pub pipeline: Pipeline,
}

/// Request body for `POST /api/pipelines/{id}/executions`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    /// Defaults to the pipeline owner
    pub user_id: Option<String>,
    pub data: Option<Value>,
}

/// Request body for `POST /api/pipelines/{id}/test`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRequest {
    #[serde(default)]
    pub mode: TestMode,
    pub trigger_data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Create pipeline management routes
pub fn create_pipeline_routes() -> Router<AppState> {
    Router::new()
        .route("/api/pipelines", post(create_pipeline).get(list_pipelines))
        .route(
            "/api/pipelines/{id}",
            get(get_pipeline).put(update_pipeline).delete(delete_pipeline),
        )
        .route("/api/pipelines/{id}/validate", post(validate_pipeline))
        .route("/api/pipelines/{id}/test", post(test_pipeline))
        .route("/api/pipelines/{id}/executions", post(start_execution))
}

/// Create a new pipeline
///
/// POST /api/pipelines
/// Body: { "pipeline": { "id": "...", "name": "...", "userId": "...", "nodes": [...], "edges": [...] } }
async fn create_pipeline(
    State(state): State<AppState>,
    Json(payload): Json<SavePipelineRequest>,
) -> ApiResult<PipelineResponse> {
    let pipeline = payload.pipeline;
    if pipeline.id.is_empty() || pipeline.name.is_empty() {
        return Err(ApiError::bad_request("pipeline id and name are required"));
    }
    if state.pipelines.get_pipeline(&pipeline.id).await?.is_some() {
        return Err(ApiError::conflict(format!("pipeline '{}' already exists", pipeline.id)));
    }

    state.pipelines.save_pipeline(&pipeline).await?;
    tracing::info!("🔥 Created pipeline: {} ({})", pipeline.id, pipeline.name);

    Ok(Json(PipelineResponse {
        id: pipeline.id.clone(),
        message: format!("Pipeline '{}' created successfully", pipeline.name),
    }))
}

/// List all pipelines
///
/// GET /api/pipelines
async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Value> {
    let pipelines = state.pipelines.list_pipelines().await?;
    Ok(Json(json!({ "pipelines": pipelines })))
}

/// GET /api/pipelines/{id}
async fn get_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Pipeline> {
    Ok(Json(load(&state, &id).await?))
}

/// Replace an existing pipeline definition
///
/// PUT /api/pipelines/{id}
async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SavePipelineRequest>,
) -> ApiResult<PipelineResponse> {
    let mut pipeline = payload.pipeline;
    // The URL wins over the body
    pipeline.id = id.clone();
    if pipeline.name.is_empty() {
        return Err(ApiError::bad_request("pipeline name is required"));
    }
    load(&state, &id).await?;

    state.pipelines.save_pipeline(&pipeline).await?;
    tracing::info!("🔥 Updated pipeline: {} ({})", pipeline.id, pipeline.name);

    Ok(Json(PipelineResponse {
        id,
        message: format!("Pipeline '{}' updated successfully", pipeline.name),
    }))
}

/// DELETE /api/pipelines/{id}
///
/// Running executions of the pipeline fail on their next node dispatch.
async fn delete_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    if !state.pipelines.delete_pipeline(&id).await? {
        return Err(crate::error::EngineError::not_found("pipeline", id).into());
    }
    tracing::info!("🗑️ Deleted pipeline: {}", id);
    Ok(Json(json!({ "message": "Pipeline deleted successfully" })))
}

/// Pre-flight check without running anything
///
/// POST /api/pipelines/{id}/validate
async fn validate_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ValidationResponse> {
    let pipeline = load(&state, &id).await?;
    let issues = validate(&pipeline);
    Ok(Json(ValidationResponse {
        valid: !issues.iter().any(ValidationIssue::is_error),
        issues,
    }))
}

/// In-process test run, delays collapsed and approvals auto-approved
///
/// POST /api/pipelines/{id}/test
/// Body: { "mode": "validation" | "full", "triggerData": {...} }
async fn test_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<TestRunRequest>>,
) -> ApiResult<TestRunReport> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let pipeline = load(&state, &id).await?;
    let report = state
        .tester
        .execute_test(&pipeline, request.mode, Trigger::manual(request.trigger_data))
        .await?;
    Ok(Json(report))
}

/// Start a manual execution
///
/// POST /api/pipelines/{id}/executions
/// Body: { "userId": "...", "data": {...} }
async fn start_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<StartExecutionRequest>>,
) -> ApiResult<Execution> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let user_id = match request.user_id {
        Some(user_id) => user_id,
        None => load(&state, &id).await?.user_id,
    };
    let execution = state
        .engine
        .start_execution(&id, &user_id, Trigger::manual(request.data))
        .await?;
    Ok(Json(execution))
}

async fn load(state: &AppState, id: &str) -> Result<Pipeline, ApiError> {
    state
        .pipelines
        .get_pipeline(id)
        .await?
        .ok_or_else(|| crate::error::EngineError::not_found("pipeline", id).into())
}
