/// HTTP API Layer
///
/// Thin axum routes over the engine entry points. It handles:
/// - Pipeline CRUD, validation and test runs
/// - Starting executions and reading their state
/// - Approving, rejecting and cancelling running executions

// Pipeline management endpoints (POST/GET/PUT/DELETE, validate, test, start)
pub mod pipelines;

// Execution endpoints (get, cancel, approve, reject)
pub mod executions;

use crate::error::EngineError;
use crate::pipeline::SqlitePipelineStore;
use crate::runtime::{ExecutionEngine, PipelineTester, ValidationIssue};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

// Re-export router builders
pub use executions::create_execution_routes;
pub use pipelines::create_pipeline_routes;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub tester: Arc<PipelineTester>,
    /// Pipeline persistence, also the engine's pipeline source
    pub pipelines: Arc<SqlitePipelineStore>,
}

/// Error response: `{ "error": "..." }`, plus `issues` for validation failures
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    issues: Option<Vec<ValidationIssue>>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            issues: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidState(_) => StatusCode::CONFLICT,
            EngineError::Validation(_) | EngineError::NoTriggerNodes(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = error.to_string();
        match error {
            EngineError::Validation(issues) => Self {
                status,
                message,
                issues: Some(issues),
            },
            _ => Self::new(status, message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        EngineError::Store(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.message);
        }
        let body = match self.issues {
            Some(issues) => json!({ "error": self.message, "issues": issues }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let status = |e: EngineError| ApiError::from(e).status();
        assert_eq!(status(EngineError::not_found("execution", "x")), StatusCode::NOT_FOUND);
        assert_eq!(status(EngineError::invalid_state("finished")), StatusCode::CONFLICT);
        assert_eq!(status(EngineError::Validation(Vec::new())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(EngineError::NoTriggerNodes("p".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(EngineError::Store(anyhow::anyhow!("disk"))), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::bad_request("name is required").status(), StatusCode::BAD_REQUEST);
    }
}
