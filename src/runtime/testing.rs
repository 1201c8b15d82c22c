/// Pre-flight validation and in-process test runs
///
/// `validate` is a pure structural check. `PipelineTester` walks the pipeline the same
/// way the engine does, but entirely in memory: no job queue, no execution store.
/// Delay edges continue immediately and approval edges are auto-approved.

use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{EngineError, EngineResult};
use crate::execution::{Execution, ExecutionStatus, NodeResult, NodeResultPatch, NodeStatus, Trigger};
use crate::pipeline::{EdgeCondition, EdgeConditionType, Pipeline, PipelineGraph};
use crate::runtime::conditions::{plan_edges, EdgeAction};
use crate::runtime::executor::NodeExecutorRegistry;
use crate::runtime::inputs::resolve_inputs;
use crate::runtime::sandbox::ExpressionSandbox;
use crate::runtime::template::render_value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks execution
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn error(node_id: Option<&str>, issue_type: &str, message: String) -> Self {
        Self {
            node_id: node_id.map(str::to_string),
            issue_type: issue_type.to_string(),
            message,
            severity: Severity::Error,
        }
    }

    fn warning(node_id: Option<&str>, issue_type: &str, message: String) -> Self {
        Self {
            node_id: node_id.map(str::to_string),
            issue_type: issue_type.to_string(),
            message,
            severity: Severity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Structural pre-flight check
///
/// A trigger candidate is a trigger-typed node without incoming edges. Without one,
/// the single `no_trigger` error is returned on its own.
pub fn validate(pipeline: &Pipeline) -> Vec<ValidationIssue> {
    let has_incoming = |id: &str| pipeline.incoming_edges(id).next().is_some();
    let has_outgoing = |id: &str| pipeline.outgoing_edges(id).next().is_some();

    let trigger_candidates = pipeline
        .nodes
        .iter()
        .filter(|node| node.is_trigger_type() && !has_incoming(&node.id))
        .count();
    if trigger_candidates == 0 {
        return vec![ValidationIssue::error(
            None,
            "no_trigger",
            "Pipeline has no trigger node".to_string(),
        )];
    }

    let mut issues = Vec::new();
    let graph = PipelineGraph::build(pipeline);
    for edge_id in graph.dangling_edges() {
        issues.push(ValidationIssue::error(
            None,
            "dangling_edge",
            format!("Edge '{}' references a node that does not exist", edge_id),
        ));
    }
    if graph.has_cycle() {
        issues.push(ValidationIssue::error(None, "cycle", "Pipeline contains a cycle".to_string()));
    }

    for node in pipeline.nodes.iter().filter(|node| !node.is_trigger_type()) {
        match (has_incoming(&node.id), has_outgoing(&node.id)) {
            (false, false) => issues.push(ValidationIssue::warning(
                Some(&node.id),
                "disconnected",
                format!("Node '{}' is not connected to any other node", node.id),
            )),
            (false, true) => issues.push(ValidationIssue::warning(
                Some(&node.id),
                "orphaned_start",
                format!("Node '{}' has outgoing edges but nothing leads to it", node.id),
            )),
            _ => {}
        }
    }

    for edge in &pipeline.edges {
        let condition = &edge.condition;
        match condition.kind {
            EdgeConditionType::Delay if condition.delay_ms.is_none() => issues.push(ValidationIssue::warning(
                Some(&edge.target),
                "missing_delay",
                format!("Delay edge '{}' has no delayMs and will run without delay", edge.id),
            )),
            EdgeConditionType::Approval
                if condition
                    .approval_config
                    .as_ref()
                    .is_some_and(|config| config.min_approvals == 0) =>
            {
                issues.push(ValidationIssue::warning(
                    Some(&edge.target),
                    "approval_threshold",
                    format!("Approval edge '{}' requires zero approvals", edge.id),
                ))
            }
            EdgeConditionType::Event => issues.push(ValidationIssue::warning(
                Some(&edge.target),
                "event_edge",
                format!("Event edge '{}' is not supported; '{}' will never run through it", edge.id, edge.target),
            )),
            _ => {}
        }
    }

    issues
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Pre-flight check only
    Validation,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestRunStatus {
    Passed,
    Failed,
    /// Some nodes were never reached (e.g. behind an event edge)
    Incomplete,
}

/// A NodeResult plus the log lines written while running that node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTestResult {
    #[serde(flatten)]
    pub result: NodeResult,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunReport {
    pub pipeline_id: String,
    pub mode: TestMode,
    pub status: TestRunStatus,
    /// completed nodes / total nodes × 100
    pub progress: f64,
    pub issues: Vec<ValidationIssue>,
    /// In dispatch order
    pub node_results: Vec<NodeTestResult>,
    pub logs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

pub struct PipelineTester {
    executors: Arc<NodeExecutorRegistry>,
    sandbox: ExpressionSandbox,
    config: EngineConfig,
}

impl PipelineTester {
    pub fn new(executors: Arc<NodeExecutorRegistry>, config: EngineConfig) -> Self {
        Self {
            executors,
            sandbox: ExpressionSandbox::new(),
            config,
        }
    }

    /// Validate, then (in full mode) run every node in-process
    ///
    /// Blocking validation errors are returned as `EngineError::Validation` in full mode
    /// and reported as a failed run in validation mode.
    pub async fn execute_test(&self, pipeline: &Pipeline, mode: TestMode, trigger: Trigger) -> EngineResult<TestRunReport> {
        let started_at = Utc::now();
        let issues = validate(pipeline);
        let blocked = issues.iter().any(ValidationIssue::is_error);
        tracing::info!(
            "🧪 Test run for pipeline {} ({:?} mode, {} issue(s))",
            pipeline.id,
            mode,
            issues.len()
        );

        let mut run = TestRun::new(pipeline, trigger);
        run.log(format!("Validation found {} issue(s)", issues.len()));

        match (mode, blocked) {
            (TestMode::Full, true) => {
                return Err(EngineError::Validation(
                    issues.into_iter().filter(ValidationIssue::is_error).collect(),
                ))
            }
            (TestMode::Validation, _) => {
                let status = if blocked { TestRunStatus::Failed } else { TestRunStatus::Passed };
                return Ok(run.into_report(mode, status, issues, started_at));
            }
            (TestMode::Full, false) => {}
        }

        self.walk(&mut run).await;

        let status = if run.execution.any_node_failed() {
            TestRunStatus::Failed
        } else if run.completed() == pipeline.nodes.len() {
            TestRunStatus::Passed
        } else {
            TestRunStatus::Incomplete
        };
        run.log(format!("🏁 Test run {:?} at {:.0}% progress", status, run.progress()));
        Ok(run.into_report(mode, status, issues, started_at))
    }

    /// Depth-first traversal with an explicit stack, in declared edge order
    async fn walk(&self, run: &mut TestRun<'_>) {
        let pipeline = run.pipeline;
        let mut stack: Vec<(String, Option<EdgeCondition>)> = pipeline
            .trigger_nodes()
            .iter()
            .rev()
            .map(|node| (node.id.clone(), None))
            .collect();

        while let Some((node_id, condition)) = stack.pop() {
            if run.execution.status.is_finished() {
                break;
            }
            let Some(node) = pipeline.node(&node_id) else {
                run.log(format!("⚠️ Edge target '{}' does not exist", node_id));
                continue;
            };
            if run.execution.node_result(&node_id).is_some_and(|result| !result.is_claimable()) {
                run.node_log(&node_id, "Already dispatched, skipping duplicate".to_string());
                continue;
            }

            let started_at = Utc::now();
            run.dispatch_order.push(node_id.clone());
            run.patch(
                &node_id,
                NodeResultPatch {
                    status: Some(NodeStatus::Running),
                    started_at: Some(started_at),
                    edge_condition: condition,
                    ..NodeResultPatch::default()
                },
            );
            run.node_log(&node_id, format!("▶️ Executing node '{}' ({})", node.id, node.node_type));

            let outcome = match resolve_inputs(
                node,
                |source| run.execution.node_result(source).and_then(|result| result.output.as_ref()),
                &self.sandbox,
            ) {
                Ok(resolved) => {
                    for notice in resolved.notices {
                        run.node_log(&node_id, format!("⚠️ {}", notice));
                    }
                    let mut rendered = node.clone();
                    rendered.config = render_value(&node.config, &resolved.values);
                    self.executors.execute(&rendered, &run.execution, &resolved.values).await
                }
                Err(e) => Err(e),
            };

            let finished_at = Utc::now();
            let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
            match outcome {
                Ok(output) => {
                    run.patch(&node_id, NodeResultPatch::succeeded(output, finished_at, duration_ms));
                    run.node_log(&node_id, format!("✅ Completed in {}ms", duration_ms));

                    let actions = plan_edges(pipeline, &run.execution.id, &node_id, &self.config, finished_at);
                    for action in actions.into_iter().rev() {
                        match action {
                            EdgeAction::RunNow { target, condition } => stack.push((target, Some(condition))),
                            EdgeAction::Delay {
                                target,
                                delay_ms,
                                condition,
                                ..
                            } => {
                                run.log(format!("⏩ Delay of {}ms before '{}' skipped in test mode", delay_ms, target));
                                stack.push((target, Some(condition)));
                            }
                            EdgeAction::AwaitApproval { target, condition, .. } => {
                                run.log(format!("👍 Approval for '{}' auto-approved in test mode", target));
                                stack.push((target, Some(condition)));
                            }
                            EdgeAction::AwaitEvent { target } => {
                                run.log(format!("Event edge to '{}' is not supported, target not dispatched", target));
                            }
                        }
                    }
                }
                Err(e) => {
                    let failure = EngineError::NodeExecution {
                        node_id: node_id.clone(),
                        message: format!("{:#}", e),
                    };
                    run.patch(&node_id, NodeResultPatch::failed(format!("{:#}", e), finished_at, Some(duration_ms)));
                    run.node_log(&node_id, format!("❌ {}", failure));
                    match self.config.failure_policy {
                        FailurePolicy::FailFast => run.execution.status = ExecutionStatus::Failed,
                        FailurePolicy::ContinueOnError => run.skip_downstream(&node_id),
                    }
                }
            }
        }
    }
}

/// In-memory state of one test run
struct TestRun<'a> {
    pipeline: &'a Pipeline,
    execution: Execution,
    dispatch_order: Vec<String>,
    node_logs: std::collections::HashMap<String, Vec<String>>,
}

impl<'a> TestRun<'a> {
    fn new(pipeline: &'a Pipeline, trigger: Trigger) -> Self {
        let mut execution = Execution::new(&pipeline.id, &pipeline.user_id, trigger);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        Self {
            pipeline,
            execution,
            dispatch_order: Vec::new(),
            node_logs: Default::default(),
        }
    }

    fn patch(&mut self, node_id: &str, patch: NodeResultPatch) {
        self.execution
            .node_results
            .entry(node_id.to_string())
            .or_insert_with(|| NodeResult::pending(node_id))
            .apply(&patch);
    }

    fn log(&mut self, message: String) {
        tracing::debug!("🧪 {}", message);
        self.execution.logs.push(format!("[{}] {}", Utc::now().to_rfc3339(), message));
    }

    fn node_log(&mut self, node_id: &str, message: String) {
        self.log(format!("{}: {}", node_id, message));
        self.node_logs.entry(node_id.to_string()).or_default().push(message);
    }

    fn skip_downstream(&mut self, node_id: &str) {
        let pipeline = self.pipeline;
        let mut frontier = vec![node_id.to_string()];
        while let Some(current) = frontier.pop() {
            for edge in pipeline.outgoing_edges(&current) {
                let target = edge.target.as_str();
                if !matches!(self.execution.node_status(target), None | Some(NodeStatus::Pending)) {
                    continue;
                }
                let unreachable = pipeline.incoming_edges(target).all(|incoming| {
                    matches!(
                        self.execution.node_status(&incoming.source),
                        Some(NodeStatus::Failed | NodeStatus::Skipped)
                    )
                });
                if unreachable {
                    self.patch(target, NodeResultPatch::status(NodeStatus::Skipped));
                    self.node_log(target, "⏭️ Skipped, upstream failed".to_string());
                    self.dispatch_order.push(target.to_string());
                    frontier.push(target.to_string());
                }
            }
        }
    }

    fn completed(&self) -> usize {
        self.execution
            .node_results
            .values()
            .filter(|result| result.status.is_terminal())
            .count()
    }

    fn progress(&self) -> f64 {
        if self.pipeline.nodes.is_empty() {
            return 100.0;
        }
        self.completed() as f64 / self.pipeline.nodes.len() as f64 * 100.0
    }

    fn into_report(
        mut self,
        mode: TestMode,
        status: TestRunStatus,
        issues: Vec<ValidationIssue>,
        started_at: DateTime<Utc>,
    ) -> TestRunReport {
        let progress = self.progress();
        let finished_at = Utc::now();
        let node_results = self
            .dispatch_order
            .iter()
            .filter_map(|node_id| {
                let result = self.execution.node_results.get(node_id)?.clone();
                let logs = self.node_logs.remove(node_id).unwrap_or_default();
                Some(NodeTestResult { result, logs })
            })
            .collect();
        TestRunReport {
            pipeline_id: self.pipeline.id.clone(),
            mode,
            status,
            progress,
            issues,
            node_results,
            logs: self.execution.logs,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0),
        }
    }
}
