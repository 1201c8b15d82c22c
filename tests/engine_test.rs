/// End-to-end engine behaviour against the in-memory stores and job queue

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use pipewright::config::{EngineConfig, FailurePolicy};
use pipewright::error::EngineError;
use pipewright::execution::{
    Execution, ExecutionPatch, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, NodeResult,
    NodeResultPatch, NodeStatus, Trigger,
};
use pipewright::pipeline::{
    ApprovalConfig, Edge, EdgeCondition, FieldMapping, InMemoryPipelineStore, Node, Pipeline, Transform,
};
use pipewright::queue::{InMemoryJobQueue, JobQueue, JobState, QueueWorker, WorkerOptions, NODE_QUEUE};
use pipewright::runtime::{ExecutionEngine, ExpressionSandbox, NodeExecutorRegistry, NodeHandler, NodeJobHandler};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `task` nodes: return `config.output`, fail when `config.fail` is set, record inputs
#[derive(Default)]
struct ScriptedHandler {
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedHandler {
    fn calls_for(&self, node_id: &str) -> Vec<Map<String, Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, inputs)| inputs.clone())
            .collect()
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    async fn execute(&self, node: &Node, _execution: &Execution, inputs: &Map<String, Value>) -> Result<Value> {
        self.calls.lock().unwrap().push((node.id.clone(), inputs.clone()));
        if node.config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            bail!("scripted failure in {}", node.id);
        }
        Ok(node.config.get("output").cloned().unwrap_or_else(|| json!({})))
    }
}

/// In-memory store that yields before every call so concurrent engine calls interleave,
/// and can fail the next log line containing a given text
#[derive(Default)]
struct InterleavingStore {
    inner: InMemoryExecutionStore,
    fail_log_containing: Mutex<Option<String>>,
}

impl InterleavingStore {
    fn fail_next_log_containing(&self, text: &str) {
        *self.fail_log_containing.lock().unwrap() = Some(text.to_string());
    }
}

#[async_trait]
impl ExecutionStore for InterleavingStore {
    async fn create(&self, execution: &Execution) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.create(execution).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Execution>> {
        tokio::task::yield_now().await;
        self.inner.find_by_id(id).await
    }

    async fn upsert_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
        patch: NodeResultPatch,
    ) -> Result<NodeResult> {
        tokio::task::yield_now().await;
        self.inner.upsert_node_result(execution_id, node_id, patch).await
    }

    async fn claim_node(
        &self,
        execution_id: &str,
        node_id: &str,
        edge_condition: Option<EdgeCondition>,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.claim_node(execution_id, node_id, edge_condition, started_at).await
    }

    async fn append_log(&self, execution_id: &str, line: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let armed = {
            let mut fail = self.fail_log_containing.lock().unwrap();
            match fail.as_deref() {
                Some(text) if line.contains(text) => fail.take(),
                _ => None,
            }
        };
        if armed.is_some() {
            bail!("log storage unavailable");
        }
        self.inner.append_log(execution_id, line).await
    }

    async fn update_fields(&self, execution_id: &str, patch: ExecutionPatch) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.update_fields(execution_id, patch).await
    }

    async fn update_fields_if(
        &self,
        execution_id: &str,
        allowed: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.update_fields_if(execution_id, allowed, patch).await
    }
}

struct Harness {
    engine: Arc<ExecutionEngine>,
    pipelines: Arc<InMemoryPipelineStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<InMemoryJobQueue>,
    handler: Arc<ScriptedHandler>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryExecutionStore::new()))
    }

    fn with_store(config: EngineConfig, executions: Arc<dyn ExecutionStore>) -> Self {
        let pipelines = Arc::new(InMemoryPipelineStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let handler = Arc::new(ScriptedHandler::default());

        let mut registry = NodeExecutorRegistry::with_builtins(ExpressionSandbox::new());
        registry.register("task", handler.clone());

        let engine = Arc::new(ExecutionEngine::new(
            pipelines.clone(),
            executions.clone(),
            queue.clone(),
            Arc::new(registry),
            config,
        ));
        Self {
            engine,
            pipelines,
            executions,
            queue,
            handler,
        }
    }

    async fn start(&self, pipeline: Pipeline, data: Option<Value>) -> Result<Execution, EngineError> {
        let id = pipeline.id.clone();
        self.pipelines.insert(pipeline).await;
        self.engine.start_execution(&id, "user-1", Trigger::manual(data)).await
    }
}

fn trigger(id: &str) -> Node {
    Node {
        id: id.to_string(),
        node_type: "manual-trigger".to_string(),
        config: Value::Null,
        field_mappings: Vec::new(),
    }
}

fn task(id: &str, config: Value) -> Node {
    Node {
        id: id.to_string(),
        node_type: "task".to_string(),
        config,
        field_mappings: Vec::new(),
    }
}

fn edge(source: &str, target: &str, condition: EdgeCondition) -> Edge {
    Edge {
        id: format!("{source}->{target}"),
        source: source.to_string(),
        target: target.to_string(),
        condition,
    }
}

fn pipeline(nodes: Vec<Node>, edges: Vec<Edge>) -> Pipeline {
    Pipeline {
        id: "pl-test".to_string(),
        name: "engine test".to_string(),
        user_id: "user-1".to_string(),
        active: true,
        nodes,
        edges,
    }
}

fn status_of(execution: &Execution, node_id: &str) -> Option<NodeStatus> {
    execution.node_status(node_id)
}

#[tokio::test]
async fn immediate_chain_runs_to_success() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({ "output": { "n": 1 } }))],
                vec![edge("a", "b", EdgeCondition::immediate())],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(status_of(&execution, "a"), Some(NodeStatus::Success));
    assert_eq!(status_of(&execution, "b"), Some(NodeStatus::Success));
    assert_eq!(execution.node_result("b").unwrap().output, Some(json!({ "n": 1 })));
    assert!(execution.finished_at.is_some());
    assert!(execution.duration_ms.is_some_and(|ms| ms >= 0));
    assert!(execution.logs.iter().any(|line| line.contains("🏁")));
}

#[tokio::test]
async fn delay_edge_parks_the_target_on_the_queue() {
    let h = Harness::new(EngineConfig::default());
    let before = Utc::now();
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({}))],
                vec![edge("a", "b", EdgeCondition::delay(5_000))],
            ),
            None,
        )
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(execution.status, ExecutionStatus::Running);
    let b = execution.node_result("b").unwrap();
    assert_eq!(b.status, NodeStatus::Delayed);
    assert!(h.handler.calls_for("b").is_empty());

    let job_id = b.delay_job_id.clone().unwrap();
    let job = h.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.queue, NODE_QUEUE);
    let run_at = job.run_at.unwrap();
    assert!(run_at >= before + TimeDelta::milliseconds(5_000));
    assert!(run_at <= after + TimeDelta::milliseconds(5_000));
}

#[tokio::test]
async fn approval_gate_waits_then_resumes() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({}))],
                vec![edge("a", "b", EdgeCondition::approval(ApprovalConfig::default()))],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::WaitingApproval);
    let b = execution.node_result("b").unwrap();
    assert_eq!(b.status, NodeStatus::WaitingApproval);
    assert!(b.pending_approval);
    let job = h.queue.get_job(b.approval_job_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(job.run_at, None);

    let err = h.engine.approve_node(&execution.id, "a").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let approved = h.engine.approve_node(&execution.id, "b").await.unwrap();
    assert_eq!(approved.status, ExecutionStatus::Success);
    assert_eq!(status_of(&approved, "b"), Some(NodeStatus::Success));
    assert!(!approved.node_result("b").unwrap().pending_approval);
    assert_eq!(h.handler.calls_for("b").len(), 1);

    // The released job fires later and finds the node already done
    h.engine.execute_node(&execution.id, "b").await.unwrap();
    assert_eq!(h.handler.calls_for("b").len(), 1);
}

fn two_approval_gates() -> Pipeline {
    pipeline(
        vec![trigger("a"), task("x", json!({})), task("y", json!({}))],
        vec![
            edge("a", "x", EdgeCondition::approval(ApprovalConfig::default())),
            edge("a", "y", EdgeCondition::approval(ApprovalConfig::default())),
        ],
    )
}

#[tokio::test]
async fn execution_keeps_waiting_until_the_last_approval() {
    let h = Harness::new(EngineConfig::default());
    let execution = h.start(two_approval_gates(), None).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::WaitingApproval);

    let after_x = h.engine.approve_node(&execution.id, "x").await.unwrap();
    assert_eq!(after_x.status, ExecutionStatus::WaitingApproval);
    assert_eq!(status_of(&after_x, "x"), Some(NodeStatus::Success));
    assert!(after_x.node_result("y").unwrap().pending_approval);

    let after_y = h.engine.approve_node(&execution.id, "y").await.unwrap();
    assert_eq!(after_y.status, ExecutionStatus::Success);
    assert_eq!(status_of(&after_y, "y"), Some(NodeStatus::Success));
}

#[tokio::test]
async fn concurrent_approvals_finish_the_execution() {
    let h = Harness::with_store(EngineConfig::default(), Arc::new(InterleavingStore::default()));
    let execution = h.start(two_approval_gates(), None).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::WaitingApproval);

    let (x, y) = tokio::join!(
        h.engine.approve_node(&execution.id, "x"),
        h.engine.approve_node(&execution.id, "y"),
    );
    x.unwrap();
    y.unwrap();

    let finished = h.engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(status_of(&finished, "x"), Some(NodeStatus::Success));
    assert_eq!(status_of(&finished, "y"), Some(NodeStatus::Success));
    assert!(!finished.has_pending_approval());
    assert_eq!(h.handler.calls_for("x").len(), 1);
    assert_eq!(h.handler.calls_for("y").len(), 1);
}

#[tokio::test]
async fn store_failure_after_claim_leaves_the_node_retryable() {
    let store = Arc::new(InterleavingStore::default());
    let h = Harness::with_store(EngineConfig::default(), store.clone());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({ "output": { "ok": true } }))],
                vec![edge("a", "b", EdgeCondition::delay(5_000))],
            ),
            None,
        )
        .await
        .unwrap();
    assert_eq!(status_of(&execution, "b"), Some(NodeStatus::Delayed));

    store.fail_next_log_containing("Executing node 'b'");
    let err = h.engine.execute_node(&execution.id, "b").await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    let released = h.engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(status_of(&released, "b"), Some(NodeStatus::Pending));
    assert_eq!(released.status, ExecutionStatus::Running);

    h.engine.execute_node(&execution.id, "b").await.unwrap();
    let finished = h.engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(status_of(&finished, "b"), Some(NodeStatus::Success));
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(h.handler.calls_for("b").len(), 1);
}

#[tokio::test]
async fn rejection_fails_node_and_execution() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({}))],
                vec![edge("a", "b", EdgeCondition::approval(ApprovalConfig::default()))],
            ),
            None,
        )
        .await
        .unwrap();
    let job_id = execution.node_result("b").unwrap().approval_job_id.clone().unwrap();

    let rejected = h.engine.reject_node(&execution.id, "b", "looks wrong").await.unwrap();
    assert_eq!(rejected.status, ExecutionStatus::Failed);
    let b = rejected.node_result("b").unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("looks wrong"));
    assert!(!b.pending_approval);
    assert!(h.queue.get_job(&job_id).await.unwrap().is_none());
    assert!(h.handler.calls_for("b").is_empty());
}

#[tokio::test]
async fn field_mapping_transforms_reach_the_handler() {
    let h = Harness::new(EngineConfig::default());
    let mut b = task("b", json!({ "output": { "done": true } }));
    b.field_mappings = vec![FieldMapping {
        source_node_id: "a".to_string(),
        source_field: "x".to_string(),
        target_field: "y".to_string(),
        transform: Transform::Uppercase,
        expression: None,
    }];

    let execution = h
        .start(
            pipeline(vec![trigger("a"), b], vec![edge("a", "b", EdgeCondition::immediate())]),
            Some(json!({ "x": "ok" })),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    let calls = h.handler.calls_for("b");
    assert_eq!(calls.len(), 1);
    assert_eq!(Value::Object(calls[0].clone()), json!({ "y": "OK" }));
}

#[tokio::test]
async fn cancel_only_from_pending_or_waiting() {
    let h = Harness::new(EngineConfig::default());

    let pending = Execution::new("pl-test", "user-1", Trigger::manual(None));
    h.executions.create(&pending).await.unwrap();
    let cancelled = h.engine.cancel_execution(&pending.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    let finished = h
        .start(pipeline(vec![trigger("a")], vec![]), None)
        .await
        .unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    let err = h.engine.cancel_execution(&finished.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn cancelled_execution_ignores_later_resumptions() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({}))],
                vec![edge("a", "b", EdgeCondition::approval(ApprovalConfig::default()))],
            ),
            None,
        )
        .await
        .unwrap();

    h.engine.cancel_execution(&execution.id).await.unwrap();
    h.engine.execute_node(&execution.id, "b").await.unwrap();

    let after = h.engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
    assert!(h.handler.calls_for("b").is_empty());
    assert!(matches!(
        h.engine.approve_node(&execution.id, "b").await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn fan_in_target_runs_once() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({})), task("c", json!({})), task("d", json!({}))],
                vec![
                    edge("a", "b", EdgeCondition::immediate()),
                    edge("a", "c", EdgeCondition::immediate()),
                    edge("b", "d", EdgeCondition::immediate()),
                    edge("c", "d", EdgeCondition::immediate()),
                ],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.handler.calls_for("d").len(), 1);
    assert_eq!(execution.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn fail_fast_stops_at_the_first_failure() {
    let h = Harness::new(EngineConfig::default());
    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("bad", json!({ "fail": true })), task("after", json!({}))],
                vec![
                    edge("a", "bad", EdgeCondition::immediate()),
                    edge("bad", "after", EdgeCondition::immediate()),
                ],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let bad = execution.node_result("bad").unwrap();
    assert_eq!(bad.status, NodeStatus::Failed);
    assert!(bad.error.as_deref().is_some_and(|e| e.contains("scripted failure")));
    assert_eq!(status_of(&execution, "after"), None);
}

#[tokio::test]
async fn continue_on_error_skips_dead_branches() {
    let h = Harness::new(EngineConfig {
        failure_policy: FailurePolicy::ContinueOnError,
        ..EngineConfig::default()
    });
    let execution = h
        .start(
            pipeline(
                vec![
                    trigger("a"),
                    task("bad", json!({ "fail": true })),
                    task("after-bad", json!({})),
                    task("good", json!({})),
                ],
                vec![
                    edge("a", "bad", EdgeCondition::immediate()),
                    edge("bad", "after-bad", EdgeCondition::immediate()),
                    edge("a", "good", EdgeCondition::immediate()),
                ],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(status_of(&execution, "after-bad"), Some(NodeStatus::Skipped));
    assert_eq!(status_of(&execution, "good"), Some(NodeStatus::Success));
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn pipeline_without_trigger_nodes_is_rejected() {
    let h = Harness::new(EngineConfig::default());
    let err = h
        .start(
            pipeline(
                vec![task("a", json!({})), task("b", json!({}))],
                vec![edge("a", "b", EdgeCondition::immediate()), edge("b", "a", EdgeCondition::immediate())],
            ),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoTriggerNodes(id) if id == "pl-test"));
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let h = Harness::new(EngineConfig::default());
    assert!(matches!(
        h.engine.get_execution("missing").await,
        Err(EngineError::NotFound { kind: "execution", .. })
    ));
    assert!(matches!(
        h.engine.start_execution("missing", "u", Trigger::manual(None)).await,
        Err(EngineError::NotFound { kind: "pipeline", .. })
    ));
}

#[tokio::test]
async fn worker_resumes_delayed_node() {
    let h = Harness::new(EngineConfig::default());
    let worker = QueueWorker::start(
        h.queue.clone(),
        NODE_QUEUE,
        Arc::new(NodeJobHandler::new(h.engine.clone())),
        WorkerOptions {
            idle_poll: Duration::from_millis(20),
            ..WorkerOptions::default()
        },
    );

    let execution = h
        .start(
            pipeline(
                vec![trigger("a"), task("b", json!({ "output": { "late": true } }))],
                vec![edge("a", "b", EdgeCondition::delay(50))],
            ),
            None,
        )
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);

    let mut status = execution.status;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.engine.get_execution(&execution.id).await.unwrap().status;
        if status.is_finished() {
            break;
        }
    }
    assert_eq!(status, ExecutionStatus::Success);
    assert_eq!(h.handler.calls_for("b").len(), 1);
    assert!(h.queue.outstanding(NODE_QUEUE).await.is_empty());

    worker.shutdown().await.unwrap();
}
