/// Execution records
///
/// One `Execution` per trigger firing, holding one `NodeResult` per dispatched node.
/// Mutations are expressed as patches so stores can apply them as atomic per-key updates.

use crate::pipeline::EdgeCondition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an execution: pending → running → {success | failed | cancelled},
/// with `waiting_approval` as a re-entrant sub-state of running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    WaitingApproval,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::WaitingApproval => "waiting_approval",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Statuses in which queued or recursive node dispatches may still act
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingApproval)
    }
}

/// Per-node status; `success`, `failed` and `skipped` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    WaitingApproval,
    Delayed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::WaitingApproval => "waiting_approval",
            Self::Delayed => "delayed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "waiting_approval" => Self::WaitingApproval,
            other => anyhow::bail!("unknown execution status: {}", other),
        })
    }
}

impl FromStr for NodeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "waiting_approval" => Self::WaitingApproval,
            "delayed" => Self::Delayed,
            other => anyhow::bail!("unknown node status: {}", other),
        })
    }
}

/// What started an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// "manual", "scheduler", "webhook" or a custom trigger type
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Node id of the trigger that fired, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
}

impl Trigger {
    pub const MANUAL: &'static str = "manual";
    pub const SCHEDULER: &'static str = "scheduler";
    pub const WEBHOOK: &'static str = "webhook";

    pub fn manual(data: Option<Value>) -> Self {
        Self {
            trigger_type: Self::MANUAL.to_string(),
            data,
            trigger_id: None,
        }
    }

    pub fn scheduler(trigger_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            trigger_type: Self::SCHEDULER.to_string(),
            data,
            trigger_id: Some(trigger_id.into()),
        }
    }
}

/// One run of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub pipeline_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    /// Keyed by node id
    pub node_results: HashMap<String, NodeResult>,
    /// Last dispatched node, for observability only
    pub current_node_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Timestamped, append-only
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(pipeline_id: impl Into<String>, user_id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            trigger,
            node_results: HashMap::new(),
            current_node_id: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            logs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn node_result(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.get(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|result| result.status)
    }

    /// Whether any node is still waiting for an approve/reject decision
    pub fn has_pending_approval(&self) -> bool {
        self.node_results.values().any(|result| result.pending_approval)
    }

    pub fn any_node_failed(&self) -> bool {
        self.node_results.values().any(|result| result.status == NodeStatus::Failed)
    }

    /// Milliseconds since `started_at` (or creation), for finalization patches
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        let start = self.started_at.unwrap_or(self.created_at);
        (now - start).num_milliseconds().max(0)
    }
}

/// Per-node execution record within one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Snapshot of the condition that produced this dispatch
    pub edge_condition: Option<EdgeCondition>,
    pub pending_approval: bool,
    pub approval_job_id: Option<String>,
    pub delay_job_id: Option<String>,
}

impl NodeResult {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            edge_condition: None,
            pending_approval: false,
            approval_job_id: None,
            delay_job_id: None,
        }
    }

    pub fn apply(&mut self, patch: &NodeResultPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(output) = &patch.output {
            self.output = Some(output.clone());
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = Some(finished_at);
        }
        if let Some(duration_ms) = patch.duration_ms {
            self.duration_ms = Some(duration_ms);
        }
        if let Some(condition) = &patch.edge_condition {
            self.edge_condition = Some(condition.clone());
        }
        if let Some(pending_approval) = patch.pending_approval {
            self.pending_approval = pending_approval;
        }
        if let Some(job_id) = &patch.approval_job_id {
            self.approval_job_id = Some(job_id.clone());
        }
        if let Some(job_id) = &patch.delay_job_id {
            self.delay_job_id = Some(job_id.clone());
        }
    }

    /// Whether a dispatch may claim this node (compare-and-swap source states)
    pub fn is_claimable(&self) -> bool {
        match self.status {
            NodeStatus::Pending | NodeStatus::Delayed => true,
            NodeStatus::WaitingApproval => !self.pending_approval,
            _ => false,
        }
    }
}

/// Partial NodeResult update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResultPatch {
    pub status: Option<NodeStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub edge_condition: Option<EdgeCondition>,
    pub pending_approval: Option<bool>,
    pub approval_job_id: Option<String>,
    pub delay_job_id: Option<String>,
}

impl NodeResultPatch {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn succeeded(output: Value, finished_at: DateTime<Utc>, duration_ms: i64) -> Self {
        Self {
            status: Some(NodeStatus::Success),
            output: Some(output),
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>, finished_at: DateTime<Utc>, duration_ms: Option<i64>) -> Self {
        Self {
            status: Some(NodeStatus::Failed),
            error: Some(error.into()),
            finished_at: Some(finished_at),
            duration_ms,
            pending_approval: Some(false),
            ..Self::default()
        }
    }
}

/// Partial update of an execution's top-level scalar fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub current_node_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn finished(status: ExecutionStatus, finished_at: DateTime<Utc>, duration_ms: i64) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            ..Self::default()
        }
    }

    pub fn apply(&self, execution: &mut Execution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(node_id) = &self.current_node_id {
            execution.current_node_id = Some(node_id.clone());
        }
        if let Some(started_at) = self.started_at {
            execution.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            execution.finished_at = Some(finished_at);
        }
        if let Some(duration_ms) = self.duration_ms {
            execution.duration_ms = Some(duration_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::WaitingApproval,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert_eq!("delayed".parse::<NodeStatus>().unwrap(), NodeStatus::Delayed);
        assert!("paused".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn claimable_states() {
        let mut result = NodeResult::pending("n");
        assert!(result.is_claimable());

        result.apply(&NodeResultPatch {
            status: Some(NodeStatus::WaitingApproval),
            pending_approval: Some(true),
            ..Default::default()
        });
        assert!(!result.is_claimable());

        result.apply(&NodeResultPatch {
            pending_approval: Some(false),
            ..Default::default()
        });
        assert!(result.is_claimable());

        result.apply(&NodeResultPatch::succeeded(json!(1), Utc::now(), 3));
        assert!(!result.is_claimable());
        assert_eq!(result.output, Some(json!(1)));
    }

    #[test]
    fn trigger_serializes_with_type_key() {
        let trigger = Trigger::scheduler("cron-node", Some(json!({ "tick": 1 })));
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value, json!({ "type": "scheduler", "data": { "tick": 1 }, "triggerId": "cron-node" }));
    }
}
