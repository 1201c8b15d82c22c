/// Queue workers
///
/// One worker task per queue. It holds a semaphore for concurrency, an interval for the
/// start-rate limit, and a watch channel for shutdown. Failed jobs are retried with a
/// backoff until `max_attempts` is spent.

use crate::config::QueueConfig;
use crate::queue::{InMemoryJobQueue, Job};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Backoff {
    #[default]
    None,
    /// delay = base_delay_ms * attempt
    Linear { base_delay_ms: u64 },
    /// delay = base_delay_ms * multiplier^(attempt - 1)
    Exponential { base_delay_ms: u64, multiplier: f64 },
}

impl Backoff {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self::Exponential {
            base_delay_ms,
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
        }
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        match *self {
            Backoff::None => 0,
            Backoff::Linear { base_delay_ms } => base_delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                let delay = base_delay_ms as f64 * factor;
                if delay >= u64::MAX as f64 {
                    u64::MAX
                } else {
                    delay as u64
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// Job starts per second
    pub rate_limit_per_sec: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound on how long an idle worker sleeps before re-checking the queue
    pub idle_poll: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_per_sec: 10,
            max_attempts: 3,
            backoff: Backoff::exponential(1000),
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl From<&QueueConfig> for WorkerOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            rate_limit_per_sec: config.rate_limit_per_sec,
            max_attempts: config.max_attempts,
            backoff: Backoff::exponential(config.backoff_base_ms),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
        }
    }
}

pub struct QueueWorker {
    queue_name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn start(
        queue: Arc<InMemoryJobQueue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        let queue_name = queue_name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = WorkerTask {
            queue,
            queue_name: queue_name.clone(),
            handler,
            options,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        Self {
            queue_name,
            shutdown_tx,
            handle,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop taking new jobs and wait for in-flight ones to finish
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| anyhow!("worker for '{}' panicked: {err}", self.queue_name))
    }
}

struct WorkerTask {
    queue: Arc<InMemoryJobQueue>,
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerTask {
    async fn run(mut self) {
        let concurrency = self.options.concurrency.max(1);
        info!(
            queue = %self.queue_name,
            concurrency,
            rate_limit_per_sec = self.options.rate_limit_per_sec,
            max_attempts = self.options.max_attempts,
            "👷 Starting queue worker",
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let rate = self.options.rate_limit_per_sec.max(1);
        let mut limiter = interval(Duration::from_secs_f64(1.0 / rate as f64));
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown_rx.changed() => break,
            };

            tokio::select! {
                _ = limiter.tick() => {}
                _ = self.shutdown_rx.changed() => break,
            }

            let Some(job) = self.next_job().await else {
                break;
            };

            debug!(queue = %self.queue_name, job_id = %job.id, attempt = job.attempts, "dispatching job");
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let options = self.options.clone();
            tokio::spawn(Self::process(queue, handler, options, job, permit));
        }

        info!(queue = %self.queue_name, "👷 Queue worker shutting down");
        let _ = semaphore.acquire_many(concurrency as u32).await;
    }

    /// Wait until a job is ready, or None on shutdown
    async fn next_job(&mut self) -> Option<Job> {
        loop {
            if *self.shutdown_rx.borrow() {
                return None;
            }
            let notified = self.queue.notified();
            if let Some(job) = self.queue.take_ready(&self.queue_name, Utc::now()).await {
                return Some(job);
            }

            let idle = self.options.idle_poll;
            let wait = match self.queue.next_run_at(&self.queue_name).await {
                Some(run_at) => (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(idle),
                None => idle,
            };

            tokio::select! {
                _ = notified => {}
                _ = sleep(wait) => {}
                _ = self.shutdown_rx.changed() => return None,
            }
        }
    }

    async fn process(
        queue: Arc<InMemoryJobQueue>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        job: Job,
        _permit: OwnedSemaphorePermit,
    ) {
        match handler.handle(&job).await {
            Ok(()) => queue.complete(&job.id).await,
            Err(err) if job.attempts < options.max_attempts => {
                let delay_ms = options.backoff.delay_ms(job.attempts);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms,
                    "⚠️ Job failed, retrying: {err:#}"
                );
                queue.retry(&job.id, delay_ms, format!("{err:#}")).await;
            }
            Err(err) => {
                error!(job_id = %job.id, attempts = job.attempts, "❌ Job failed permanently: {err:#}");
                queue.fail(&job.id, format!("{err:#}")).await;
            }
        }
    }
}
