/// Delay-capable job queue
///
/// The engine only needs four operations from a queue: enqueue with an optional delay
/// and job id, look a job up, remove it, and release its delay. Worker registration is
/// specific to the backing implementation.

pub mod memory;
pub mod worker;

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::InMemoryJobQueue;
pub use worker::{Backoff, JobHandler, QueueWorker, WorkerOptions};

/// Queue carrying `{executionId, nodeId}` resumptions
pub const NODE_QUEUE: &str = "pipeline-nodes";
/// Queue carrying scheduler-built execution start requests
pub const EXECUTION_QUEUE: &str = "pipeline-executions";

/// A delay this large never elapses; the job waits for `release_delay`
pub const INDEFINITE_DELAY_MS: u64 = u64::MAX;

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub delay_ms: Option<u64>,
    /// Caller-chosen id; enqueueing an id that is still outstanding returns it unchanged
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn delayed(delay_ms: u64, job_id: impl Into<String>) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            job_id: Some(job_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run
    Waiting,
    /// Waiting for `run_at`, or suspended when `run_at` is None
    Delayed,
    Active,
    Failed,
}

impl JobState {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    pub state: JobState,
    /// None while suspended indefinitely
    pub run_at: Option<DateTime<Utc>>,
    /// Attempts started so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the job has given up
    pub failed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> Result<String, QueueError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    async fn remove_job(&self, job_id: &str) -> Result<(), QueueError>;

    /// Set the job's remaining delay to zero
    async fn release_delay(&self, job_id: &str) -> Result<(), QueueError>;
}
