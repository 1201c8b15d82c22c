/// Job payloads and the worker handlers that feed them into the engine

use crate::error::EngineError;
use crate::execution::Trigger;
use crate::queue::{Job, JobHandler};
use crate::runtime::engine::ExecutionEngine;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload on the `pipeline-nodes` queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJobPayload {
    pub execution_id: String,
    pub node_id: String,
}

/// Payload on the `pipeline-executions` queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub pipeline_id: String,
    pub user_id: String,
    pub trigger: Trigger,
}

/// Resumes delayed and approved nodes
pub struct NodeJobHandler {
    engine: Arc<ExecutionEngine>,
}

impl NodeJobHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for NodeJobHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let payload: NodeJobPayload = serde_json::from_value(job.payload.clone())?;
        tracing::debug!(job_id = %job.id, "📬 Resuming node {} of execution {}", payload.node_id, payload.execution_id);
        self.engine
            .execute_node(&payload.execution_id, &payload.node_id)
            .await?;
        Ok(())
    }
}

/// Starts executions requested by the scheduler
pub struct ExecutionStartHandler {
    engine: Arc<ExecutionEngine>,
}

impl ExecutionStartHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for ExecutionStartHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let request: ExecutionRequest = serde_json::from_value(job.payload.clone())?;
        match self
            .engine
            .start_execution(&request.pipeline_id, &request.user_id, request.trigger)
            .await
        {
            Ok(execution) => {
                tracing::info!(job_id = %job.id, "🚀 Started execution {} ({})", execution.id, execution.status);
                Ok(())
            }
            // Permanent failures, not retried
            Err(e @ (EngineError::NotFound { .. } | EngineError::NoTriggerNodes(_))) => {
                tracing::error!(job_id = %job.id, "❌ Dropping execution request for {}: {}", request.pipeline_id, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
