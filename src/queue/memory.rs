/// In-process job queue
///
/// Jobs live in a map guarded by a tokio RwLock; workers are woken through a `Notify`
/// whenever a job becomes ready, and otherwise sleep until the earliest `run_at`.
/// Completed jobs are dropped so a deterministic id can be reused afterwards; failed jobs
/// are kept for inspection up to `FAILED_JOB_RETENTION`, oldest evicted first.

use crate::error::QueueError;
use crate::queue::{Job, JobOptions, JobQueue, JobState};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Notify, RwLock};

/// Failed jobs kept around for inspection
pub const FAILED_JOB_RETENTION: usize = 100;

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<String, Job>>,
    wakeup: Notify,
}

/// `now + delay_ms`, or None when the delay does not fit in a timestamp
fn run_at_after(now: DateTime<Utc>, delay_ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(delay_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|delay| now.checked_add_signed(delay))
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Future resolving the next time a job becomes ready
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wakeup.notified()
    }

    /// Claim the earliest ready job of `queue`, marking it active
    pub(crate) async fn take_ready(&self, queue: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .values_mut()
            .filter(|job| job.queue == queue)
            .filter(|job| matches!(job.state, JobState::Waiting | JobState::Delayed))
            .filter(|job| job.run_at.is_some_and(|run_at| run_at <= now))
            .min_by_key(|job| job.run_at)?;
        job.state = JobState::Active;
        job.attempts += 1;
        Some(job.clone())
    }

    /// Earliest `run_at` among jobs of `queue` that are not suspended
    pub(crate) async fn next_run_at(&self, queue: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.queue == queue && matches!(job.state, JobState::Waiting | JobState::Delayed))
            .filter_map(|job| job.run_at)
            .min()
    }

    pub(crate) async fn complete(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    /// Put an active job back with a backoff delay
    pub(crate) async fn retry(&self, job_id: &str, delay_ms: u64, error: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = JobState::Delayed;
            job.run_at = run_at_after(Utc::now(), delay_ms);
            job.last_error = Some(error);
        }
        drop(jobs);
        self.wakeup.notify_waiters();
    }

    pub(crate) async fn fail(&self, job_id: &str, error: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = JobState::Failed;
            job.last_error = Some(error);
            job.failed_at = Some(Utc::now());
        }

        let mut failed: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|job| job.state == JobState::Failed)
            .map(|job| (job.failed_at.unwrap_or(job.created_at), job.id.clone()))
            .collect();
        if failed.len() > FAILED_JOB_RETENTION {
            failed.sort();
            let excess = failed.len() - FAILED_JOB_RETENTION;
            for (_, id) in failed.into_iter().take(excess) {
                jobs.remove(&id);
            }
            tracing::debug!("🧹 Evicted {} failed job(s) over the retention cap", excess);
        }
    }

    /// Jobs of `queue` that have not finished (waiting, delayed, suspended or active)
    pub async fn outstanding(&self, queue: &str) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.queue == queue && job.state.is_outstanding())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, queue: &str, payload: Value, options: JobOptions) -> Result<String, QueueError> {
        let now = Utc::now();
        let job_id = options
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job_id) {
            if existing.state.is_outstanding() {
                tracing::debug!("📦 Job {} already outstanding on '{}', not re-enqueued", job_id, queue);
                return Ok(job_id);
            }
        }

        let (state, run_at) = match options.delay_ms {
            None | Some(0) => (JobState::Waiting, Some(now)),
            Some(delay_ms) => (JobState::Delayed, run_at_after(now, delay_ms)),
        };

        jobs.insert(
            job_id.clone(),
            Job {
                id: job_id.clone(),
                queue: queue.to_string(),
                payload,
                state,
                run_at,
                attempts: 0,
                last_error: None,
                created_at: now,
                failed_at: None,
            },
        );
        drop(jobs);

        tracing::debug!("📦 Enqueued job {} on '{}' (run_at: {:?})", job_id, queue, run_at);
        self.wakeup.notify_waiters();
        Ok(job_id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), QueueError> {
        match self.jobs.write().await.remove(job_id) {
            Some(_) => Ok(()),
            None => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }

    async fn release_delay(&self, job_id: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if matches!(job.state, JobState::Waiting | JobState::Delayed) {
            job.state = JobState::Waiting;
            job.run_at = Some(Utc::now());
        }
        drop(jobs);
        self.wakeup.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::INDEFINITE_DELAY_MS;
    use serde_json::json;

    #[tokio::test]
    async fn delayed_job_becomes_ready_at_run_at() {
        let queue = InMemoryJobQueue::new();
        let before = Utc::now();
        let id = queue
            .enqueue("q", json!({}), JobOptions::delayed(60_000, "d1"))
            .await
            .unwrap();

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        let run_at = job.run_at.unwrap();
        assert!(run_at >= before + TimeDelta::milliseconds(60_000));
        assert!(run_at <= Utc::now() + TimeDelta::milliseconds(60_000));

        assert!(queue.take_ready("q", Utc::now()).await.is_none());
        assert!(queue.take_ready("q", run_at).await.is_some());
    }

    #[tokio::test]
    async fn indefinite_delay_waits_for_release() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .enqueue("q", json!({}), JobOptions::delayed(INDEFINITE_DELAY_MS, "approval:e:n"))
            .await
            .unwrap();
        assert!(queue.get_job(&id).await.unwrap().unwrap().run_at.is_none());
        assert!(queue.next_run_at("q").await.is_none());

        queue.release_delay(&id).await.unwrap();
        let job = queue.take_ready("q", Utc::now()).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn outstanding_ids_are_not_duplicated() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("q", json!({ "n": 1 }), JobOptions::delayed(1000, "same")).await.unwrap();
        queue.enqueue("q", json!({ "n": 2 }), JobOptions::delayed(1000, "same")).await.unwrap();
        let outstanding = queue.outstanding("q").await;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].payload, json!({ "n": 1 }));

        queue.complete("same").await;
        queue.enqueue("q", json!({ "n": 3 }), JobOptions::delayed(1000, "same")).await.unwrap();
        assert_eq!(queue.outstanding("q").await[0].payload, json!({ "n": 3 }));
    }

    #[tokio::test]
    async fn failed_jobs_beyond_retention_are_evicted_oldest_first() {
        let queue = InMemoryJobQueue::new();
        for n in 0..=FAILED_JOB_RETENTION {
            let id = format!("job-{n:04}");
            queue.enqueue("q", json!({ "n": n }), JobOptions::delayed(0, &id)).await.unwrap();
            queue.fail(&id, "boom".to_string()).await;
        }

        let jobs = queue.jobs.read().await;
        let failed = jobs.values().filter(|job| job.state == JobState::Failed).count();
        assert_eq!(failed, FAILED_JOB_RETENTION);
        assert!(!jobs.contains_key("job-0000"));
        let newest = &jobs[&format!("job-{:04}", FAILED_JOB_RETENTION)];
        assert_eq!(newest.last_error.as_deref(), Some("boom"));
        assert!(newest.failed_at.is_some());
    }

    #[tokio::test]
    async fn missing_jobs_report_not_found() {
        let queue = InMemoryJobQueue::new();
        assert!(matches!(queue.release_delay("nope").await, Err(QueueError::JobNotFound(_))));
        assert!(matches!(queue.remove_job("nope").await, Err(QueueError::JobNotFound(_))));
    }
}
