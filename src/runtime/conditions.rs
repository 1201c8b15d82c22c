/// Edge condition evaluation
///
/// Turns the outgoing edges of a completed node into dispatch actions. Planning is
/// pure; the engine performs the queue and store side effects, and the test runner
/// collapses the suspending actions into immediate continuation.

use crate::config::{EngineConfig, JobIdPolicy};
use crate::pipeline::{EdgeCondition, EdgeConditionType, Pipeline};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeAction {
    /// Dispatch the target in the current call stack
    RunNow { target: String, condition: EdgeCondition },
    /// Queue the target to run after `delay_ms`
    Delay {
        target: String,
        delay_ms: u64,
        job_id: String,
        condition: EdgeCondition,
    },
    /// Queue a suspended job and park the target until approved or rejected
    AwaitApproval {
        target: String,
        job_id: String,
        condition: EdgeCondition,
    },
    /// Event edges are not dispatched
    AwaitEvent { target: String },
}

impl EdgeAction {
    pub fn target(&self) -> &str {
        match self {
            Self::RunNow { target, .. }
            | Self::Delay { target, .. }
            | Self::AwaitApproval { target, .. }
            | Self::AwaitEvent { target } => target,
        }
    }
}

/// Job id for a queued dispatch, per the configured id policy
///
/// Deterministic ids allow at most one outstanding job per (kind, execution, node);
/// unique ids carry the enqueue time in milliseconds.
pub fn job_id(kind: &str, policy: JobIdPolicy, execution_id: &str, node_id: &str, now: DateTime<Utc>) -> String {
    match policy {
        JobIdPolicy::Deterministic => format!("{}:{}:{}", kind, execution_id, node_id),
        JobIdPolicy::Unique => format!("{}:{}:{}:{}", kind, execution_id, node_id, now.timestamp_millis()),
    }
}

/// Plan every outgoing edge of `node_id`, in declaration order
pub fn plan_edges(
    pipeline: &Pipeline,
    execution_id: &str,
    node_id: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<EdgeAction> {
    pipeline
        .outgoing_edges(node_id)
        .map(|edge| {
            let target = edge.target.clone();
            let condition = edge.condition.clone();
            match condition.kind {
                EdgeConditionType::Immediate => EdgeAction::RunNow { target, condition },
                EdgeConditionType::Delay => EdgeAction::Delay {
                    job_id: job_id("delay", config.delay_job_ids, execution_id, &target, now),
                    delay_ms: condition.delay_ms.unwrap_or(0),
                    target,
                    condition,
                },
                EdgeConditionType::Approval => EdgeAction::AwaitApproval {
                    job_id: job_id("approval", config.approval_job_ids, execution_id, &target, now),
                    target,
                    condition,
                },
                EdgeConditionType::Event => EdgeAction::AwaitEvent { target },
            }
        })
        .collect()
}
