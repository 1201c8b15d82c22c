/// Queue-backed pipeline execution engine
///
/// Turns a stored pipeline plus a trigger into an Execution, dispatches trigger nodes,
/// propagates through edges (recursively for immediate edges, via the job queue for
/// delay and approval edges) and finalizes the execution once every node is terminal.
///
/// All writes go through per-key store operations. A node is only ever run by the
/// dispatch that wins `claim_node`, which deduplicates fan-in and approval re-entry.

use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{EngineError, EngineResult};
use crate::execution::{
    Execution, ExecutionPatch, ExecutionStatus, ExecutionStore, NodeResultPatch, NodeStatus, Trigger,
};
use crate::pipeline::{EdgeCondition, Node, Pipeline, PipelineStore};
use crate::queue::{JobOptions, JobQueue, INDEFINITE_DELAY_MS, NODE_QUEUE};
use crate::runtime::conditions::{plan_edges, EdgeAction};
use crate::runtime::executor::NodeExecutorRegistry;
use crate::runtime::inputs::resolve_inputs;
use crate::runtime::jobs::NodeJobPayload;
use crate::runtime::sandbox::ExpressionSandbox;
use crate::runtime::template::render_value;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;

pub struct ExecutionEngine {
    pipelines: Arc<dyn PipelineStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn JobQueue>,
    executors: Arc<NodeExecutorRegistry>,
    sandbox: ExpressionSandbox,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        pipelines: Arc<dyn PipelineStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn JobQueue>,
        executors: Arc<NodeExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pipelines,
            executions,
            queue,
            executors,
            sandbox: ExpressionSandbox::new(),
            config,
        }
    }

    pub fn with_sandbox(mut self, sandbox: ExpressionSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create an execution for `pipeline_id` and dispatch its trigger nodes
    ///
    /// Returns once the synchronous part of the run is done; delayed and approval-gated
    /// branches continue through the job queue.
    pub async fn start_execution(&self, pipeline_id: &str, user_id: &str, trigger: Trigger) -> EngineResult<Execution> {
        let pipeline = self.load_pipeline(pipeline_id).await?;
        let execution = Execution::new(&pipeline.id, user_id, trigger);
        let execution_id = execution.id.clone();
        self.executions.create(&execution).await?;
        self.log(
            &execution_id,
            format!(
                "Execution created for pipeline '{}' ({} trigger)",
                pipeline.id, execution.trigger.trigger_type
            ),
        )
        .await?;

        let trigger_nodes: Vec<String> = pipeline.trigger_nodes().iter().map(|node| node.id.clone()).collect();
        if trigger_nodes.is_empty() {
            let now = Utc::now();
            self.executions
                .update_fields(&execution_id, ExecutionPatch::finished(ExecutionStatus::Failed, now, 0))
                .await?;
            self.log(&execution_id, "❌ Pipeline has no trigger nodes").await?;
            return Err(EngineError::NoTriggerNodes(pipeline.id.clone()));
        }

        self.executions
            .update_fields(
                &execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    started_at: Some(Utc::now()),
                    ..ExecutionPatch::default()
                },
            )
            .await?;
        self.log(
            &execution_id,
            format!("🚀 Starting execution from trigger nodes: {}", trigger_nodes.join(", ")),
        )
        .await?;

        for node_id in &trigger_nodes {
            self.dispatch(&execution_id, node_id, Some(&pipeline), None).await?;
        }

        self.load_execution(&execution_id).await
    }

    /// Run one node of an existing execution; the entry point for queue workers
    pub async fn execute_node(&self, execution_id: &str, node_id: &str) -> EngineResult<()> {
        self.dispatch(execution_id, node_id, None, None).await
    }

    /// Same as `execute_node` with an already-loaded pipeline
    pub async fn execute_node_in(&self, execution_id: &str, node_id: &str, pipeline: &Pipeline) -> EngineResult<()> {
        self.dispatch(execution_id, node_id, Some(pipeline), None).await
    }

    pub async fn get_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        self.load_execution(execution_id).await
    }

    /// Resume a node parked behind an approval edge
    ///
    /// The execution goes back to `running` once no node is pending approval any more,
    /// decided on a fresh load after the approved node ran.
    pub async fn approve_node(&self, execution_id: &str, node_id: &str) -> EngineResult<Execution> {
        let execution = self.load_execution(execution_id).await?;
        let result = execution
            .node_result(node_id)
            .ok_or_else(|| EngineError::not_found("node result", node_id))?;
        if !result.pending_approval {
            return Err(EngineError::invalid_state(format!(
                "node '{}' is not pending approval (status: {})",
                node_id, result.status
            )));
        }
        if execution.status.is_finished() {
            return Err(EngineError::invalid_state(format!(
                "execution '{}' is already {}",
                execution_id, execution.status
            )));
        }

        if let Some(job_id) = &result.approval_job_id {
            if let Err(e) = self.queue.release_delay(job_id).await {
                tracing::warn!(execution_id, node_id, "⚠️ Could not release approval job {}: {}", job_id, e);
            }
        }
        self.executions
            .upsert_node_result(
                execution_id,
                node_id,
                NodeResultPatch {
                    pending_approval: Some(false),
                    ..NodeResultPatch::default()
                },
            )
            .await?;
        self.log(execution_id, format!("👍 Node '{}' approved", node_id)).await?;

        let pipeline = self.load_pipeline(&execution.pipeline_id).await?;
        self.dispatch(execution_id, node_id, Some(&pipeline), None).await?;
        self.resume_after_approval(execution_id, &pipeline).await?;
        self.load_execution(execution_id).await
    }

    /// Revert `waiting_approval` to `running` when nothing is pending approval, then finalize
    async fn resume_after_approval(&self, execution_id: &str, pipeline: &Pipeline) -> EngineResult<()> {
        let execution = self.load_execution(execution_id).await?;
        if execution.has_pending_approval() {
            return Ok(());
        }
        let resumed = self
            .executions
            .update_fields_if(
                execution_id,
                &[ExecutionStatus::WaitingApproval],
                ExecutionPatch::status(ExecutionStatus::Running),
            )
            .await?;
        if resumed {
            self.log(execution_id, "▶️ No approvals pending, execution running again").await?;
        }
        self.check_completion(execution_id, pipeline).await
    }

    /// Fail a node parked behind an approval edge, and with it the execution
    pub async fn reject_node(&self, execution_id: &str, node_id: &str, reason: &str) -> EngineResult<Execution> {
        let execution = self.load_execution(execution_id).await?;
        let result = execution
            .node_result(node_id)
            .ok_or_else(|| EngineError::not_found("node result", node_id))?;
        if !result.pending_approval {
            return Err(EngineError::invalid_state(format!(
                "node '{}' is not pending approval (status: {})",
                node_id, result.status
            )));
        }
        if execution.status.is_finished() {
            return Err(EngineError::invalid_state(format!(
                "execution '{}' is already {}",
                execution_id, execution.status
            )));
        }

        let now = Utc::now();
        self.executions
            .upsert_node_result(execution_id, node_id, NodeResultPatch::failed(reason, now, None))
            .await?;
        self.executions
            .update_fields_if(
                execution_id,
                &[ExecutionStatus::Running, ExecutionStatus::WaitingApproval],
                ExecutionPatch::finished(ExecutionStatus::Failed, now, execution.elapsed_ms(now)),
            )
            .await?;

        if let Some(job_id) = &result.approval_job_id {
            if let Err(e) = self.queue.remove_job(job_id).await {
                tracing::debug!(execution_id, node_id, "Approval job {} already gone: {}", job_id, e);
            }
        }
        self.log(execution_id, format!("👎 Node '{}' rejected: {}", node_id, reason)).await?;
        self.load_execution(execution_id).await
    }

    /// Cancel an execution that has not started running or is parked on an approval
    ///
    /// Already-queued delay and approval jobs stay in the queue; when they fire they
    /// find the execution cancelled and do nothing.
    pub async fn cancel_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        let execution = self.load_execution(execution_id).await?;
        let now = Utc::now();
        let cancelled = self
            .executions
            .update_fields_if(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::WaitingApproval],
                ExecutionPatch::finished(ExecutionStatus::Cancelled, now, execution.elapsed_ms(now)),
            )
            .await?;
        if !cancelled {
            let current = self.load_execution(execution_id).await?;
            return Err(EngineError::invalid_state(format!(
                "cannot cancel execution '{}' in status {}",
                execution_id, current.status
            )));
        }
        self.log(execution_id, "🛑 Execution cancelled").await?;
        self.load_execution(execution_id).await
    }

    /// Claim, run and propagate one node. Boxed because immediate edges recurse.
    fn dispatch<'a>(
        &'a self,
        execution_id: &'a str,
        node_id: &'a str,
        pipeline: Option<&'a Pipeline>,
        condition: Option<EdgeCondition>,
    ) -> BoxFuture<'a, EngineResult<()>> {
        async move {
            let execution = self.load_execution(execution_id).await?;
            if !execution.status.accepts_dispatch() {
                tracing::info!(
                    execution_id,
                    node_id,
                    "⏭️ Skipping dispatch, execution is {}",
                    execution.status
                );
                return Ok(());
            }

            let loaded;
            let pipeline = match pipeline {
                Some(pipeline) => pipeline,
                None => {
                    loaded = self.load_pipeline(&execution.pipeline_id).await?;
                    &loaded
                }
            };
            let node = pipeline
                .node(node_id)
                .ok_or_else(|| EngineError::not_found("node", node_id))?;

            let started_at = Utc::now();
            if !self.executions.claim_node(execution_id, node_id, condition, started_at).await? {
                tracing::warn!(execution_id, node_id, "⚠️ Node already claimed by another dispatch, skipping");
                // The losing branch may be the last one to finish on a fan-in
                return self.check_completion(execution_id, pipeline).await;
            }

            // A retry must be able to claim the node again
            if let Err(e) = self.run_claimed(execution_id, node, pipeline, started_at).await {
                self.release_claim(execution_id, node_id, &e).await;
                return Err(e);
            }

            // Not only on sinks: a fan-in target may already be done when its last branch lands
            self.check_completion(execution_id, pipeline).await
        }
        .boxed()
    }

    /// Everything after a won claim: run the handler, record the outcome, follow the edges
    async fn run_claimed(
        &self,
        execution_id: &str,
        node: &Node,
        pipeline: &Pipeline,
        started_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let node_id = node.id.as_str();
        self.executions
            .update_fields(
                execution_id,
                ExecutionPatch {
                    current_node_id: Some(node_id.to_string()),
                    ..ExecutionPatch::default()
                },
            )
            .await?;
        self.log(execution_id, format!("▶️ Executing node '{}' ({})", node.id, node.node_type))
            .await?;

        // Reload so outputs written by sibling branches are visible to the mappings
        let execution = self.load_execution(execution_id).await?;
        let outcome = match resolve_inputs(
            node,
            |source| execution.node_result(source).and_then(|result| result.output.as_ref()),
            &self.sandbox,
        ) {
            Ok(resolved) => {
                for notice in &resolved.notices {
                    self.log(execution_id, format!("⚠️ {}", notice)).await?;
                }
                let mut rendered = node.clone();
                rendered.config = render_value(&node.config, &resolved.values);
                self.executors.execute(&rendered, &execution, &resolved.values).await
            }
            Err(e) => Err(e),
        };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        match outcome {
            Ok(output) => {
                self.executions
                    .upsert_node_result(
                        execution_id,
                        node_id,
                        NodeResultPatch::succeeded(output, finished_at, duration_ms),
                    )
                    .await?;
                self.log(execution_id, format!("✅ Node '{}' completed in {}ms", node_id, duration_ms))
                    .await?;
                self.evaluate_edges(execution_id, pipeline, node_id).await?;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.executions
                    .upsert_node_result(
                        execution_id,
                        node_id,
                        NodeResultPatch::failed(message.clone(), finished_at, Some(duration_ms)),
                    )
                    .await?;
                let failure = EngineError::NodeExecution {
                    node_id: node_id.to_string(),
                    message,
                };
                self.log(execution_id, format!("❌ {}", failure)).await?;
                self.handle_node_failure(execution_id, pipeline, node_id).await?;
            }
        }
        Ok(())
    }

    /// Put a node whose outcome was never recorded back to `pending`
    async fn release_claim(&self, execution_id: &str, node_id: &str, error: &EngineError) {
        let still_running = match self.executions.find_by_id(execution_id).await {
            Ok(Some(execution)) => execution.node_status(node_id) == Some(NodeStatus::Running),
            _ => true,
        };
        if !still_running {
            return;
        }
        tracing::warn!(execution_id, node_id, "↩️ Releasing node after engine error: {}", error);
        if let Err(e) = self
            .executions
            .upsert_node_result(execution_id, node_id, NodeResultPatch::status(NodeStatus::Pending))
            .await
        {
            tracing::error!(execution_id, node_id, "❌ Could not release node: {:#}", e);
        }
    }

    /// Act on every outgoing edge of a completed node, in declared order
    async fn evaluate_edges(&self, execution_id: &str, pipeline: &Pipeline, node_id: &str) -> EngineResult<()> {
        for action in plan_edges(pipeline, execution_id, node_id, &self.config, Utc::now()) {
            match action {
                EdgeAction::RunNow { target, condition } => {
                    self.dispatch(execution_id, &target, Some(pipeline), Some(condition))
                        .await?;
                }
                EdgeAction::Delay {
                    target,
                    delay_ms,
                    job_id,
                    condition,
                } => {
                    if !self.target_is_open(execution_id, &target).await? {
                        continue;
                    }
                    let job_id = self.enqueue_node(execution_id, &target, delay_ms, job_id).await?;
                    self.executions
                        .upsert_node_result(
                            execution_id,
                            &target,
                            NodeResultPatch {
                                status: Some(NodeStatus::Delayed),
                                edge_condition: Some(condition),
                                delay_job_id: Some(job_id.clone()),
                                ..NodeResultPatch::default()
                            },
                        )
                        .await?;
                    self.log(
                        execution_id,
                        format!("⏳ Node '{}' scheduled in {}ms (job {})", target, delay_ms, job_id),
                    )
                    .await?;
                }
                EdgeAction::AwaitApproval {
                    target,
                    job_id,
                    condition,
                } => {
                    if !self.target_is_open(execution_id, &target).await? {
                        continue;
                    }
                    let job_id = self
                        .enqueue_node(execution_id, &target, INDEFINITE_DELAY_MS, job_id)
                        .await?;
                    self.executions
                        .upsert_node_result(
                            execution_id,
                            &target,
                            NodeResultPatch {
                                status: Some(NodeStatus::WaitingApproval),
                                edge_condition: Some(condition),
                                pending_approval: Some(true),
                                approval_job_id: Some(job_id.clone()),
                                ..NodeResultPatch::default()
                            },
                        )
                        .await?;
                    self.executions
                        .update_fields_if(
                            execution_id,
                            &[ExecutionStatus::Running],
                            ExecutionPatch::status(ExecutionStatus::WaitingApproval),
                        )
                        .await?;
                    self.log(
                        execution_id,
                        format!("⏸️ Node '{}' waiting for approval (job {})", target, job_id),
                    )
                    .await?;
                }
                EdgeAction::AwaitEvent { target } => {
                    self.log(
                        execution_id,
                        format!("Event edge from '{}' to '{}' is not supported, target not dispatched", node_id, target),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// A queued edge must not overwrite a target another branch already claimed or finished
    async fn target_is_open(&self, execution_id: &str, target: &str) -> EngineResult<bool> {
        let execution = self.load_execution(execution_id).await?;
        match execution.node_result(target) {
            Some(result) if !result.is_claimable() || result.pending_approval => {
                tracing::warn!(
                    execution_id,
                    node_id = target,
                    "⚠️ Target already {}, not queued again",
                    result.status
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn enqueue_node(&self, execution_id: &str, node_id: &str, delay_ms: u64, job_id: String) -> EngineResult<String> {
        let payload = serde_json::to_value(NodeJobPayload {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
        })
        .map_err(anyhow::Error::from)?;
        Ok(self
            .queue
            .enqueue(NODE_QUEUE, payload, JobOptions::delayed(delay_ms, job_id))
            .await?)
    }

    async fn handle_node_failure(&self, execution_id: &str, pipeline: &Pipeline, node_id: &str) -> EngineResult<()> {
        match self.config.failure_policy {
            FailurePolicy::FailFast => {
                let execution = self.load_execution(execution_id).await?;
                let now = Utc::now();
                let failed = self
                    .executions
                    .update_fields_if(
                        execution_id,
                        &[ExecutionStatus::Running, ExecutionStatus::WaitingApproval],
                        ExecutionPatch::finished(ExecutionStatus::Failed, now, execution.elapsed_ms(now)),
                    )
                    .await?;
                if failed {
                    self.log(execution_id, format!("❌ Execution failed at node '{}'", node_id))
                        .await?;
                }
            }
            FailurePolicy::ContinueOnError => {
                self.skip_downstream(execution_id, pipeline, node_id).await?;
                self.check_completion(execution_id, pipeline).await?;
            }
        }
        Ok(())
    }

    /// Mark as skipped every downstream node whose predecessors all failed or were skipped
    async fn skip_downstream(&self, execution_id: &str, pipeline: &Pipeline, node_id: &str) -> EngineResult<()> {
        let mut frontier = vec![node_id.to_string()];
        while let Some(current) = frontier.pop() {
            let execution = self.load_execution(execution_id).await?;
            for edge in pipeline.outgoing_edges(&current) {
                let target = &edge.target;
                if !matches!(execution.node_status(target), None | Some(NodeStatus::Pending)) {
                    continue;
                }
                let unreachable = pipeline.incoming_edges(target).all(|incoming| {
                    incoming.source == current
                        || matches!(
                            execution.node_status(&incoming.source),
                            Some(NodeStatus::Failed | NodeStatus::Skipped)
                        )
                });
                if !unreachable {
                    continue;
                }
                self.executions
                    .upsert_node_result(
                        execution_id,
                        target,
                        NodeResultPatch {
                            status: Some(NodeStatus::Skipped),
                            finished_at: Some(Utc::now()),
                            ..NodeResultPatch::default()
                        },
                    )
                    .await?;
                self.log(execution_id, format!("⏭️ Node '{}' skipped, upstream failed", target))
                    .await?;
                frontier.push(target.clone());
            }
        }
        Ok(())
    }

    /// Finalize once every node is terminal and nothing waits for approval
    async fn check_completion(&self, execution_id: &str, pipeline: &Pipeline) -> EngineResult<()> {
        let execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }
        let all_terminal = pipeline
            .nodes
            .iter()
            .all(|node| execution.node_status(&node.id).is_some_and(|status| status.is_terminal()));
        if !all_terminal {
            return Ok(());
        }

        let status = if execution.any_node_failed() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        };
        let now = Utc::now();
        let duration_ms = execution.elapsed_ms(now);
        let finished = self
            .executions
            .update_fields_if(
                execution_id,
                &[ExecutionStatus::Running],
                ExecutionPatch::finished(status, now, duration_ms),
            )
            .await?;
        if finished {
            let count = |wanted: NodeStatus| {
                execution
                    .node_results
                    .values()
                    .filter(|result| result.status == wanted)
                    .count()
            };
            self.log(
                execution_id,
                format!(
                    "🏁 Execution {} in {}ms: {} succeeded, {} failed, {} skipped",
                    status,
                    duration_ms,
                    count(NodeStatus::Success),
                    count(NodeStatus::Failed),
                    count(NodeStatus::Skipped)
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> EngineResult<Pipeline> {
        self.pipelines
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| EngineError::not_found("pipeline", pipeline_id))
    }

    async fn load_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        self.executions
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))
    }

    /// Append a timestamped line to the execution log and mirror it to tracing
    async fn log(&self, execution_id: &str, message: impl AsRef<str>) -> EngineResult<()> {
        let message = message.as_ref();
        tracing::info!(execution_id, "{}", message);
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), message);
        self.executions.append_log(execution_id, &line).await?;
        Ok(())
    }
}
