/// Time-based trigger scheduler
///
/// Polls active pipelines on a fixed interval (and once at start) for enabled
/// `schedule-trigger` nodes, and pushes an execution request onto the
/// `pipeline-executions` queue for each trigger that is due. The poll window equals the
/// interval. Firing is not deduplicated across polls.

use crate::execution::Trigger;
use crate::pipeline::{Node, Pipeline, PipelineStore};
use crate::queue::{JobOptions, JobQueue, EXECUTION_QUEUE};
use crate::runtime::jobs::ExecutionRequest;
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub const SCHEDULE_TRIGGER_TYPE: &str = "schedule-trigger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ScheduleType {
    #[serde(rename = "one-time")]
    OneTime,
    #[serde(rename = "recurring")]
    Recurring,
}

/// `config` of a `schedule-trigger` node
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTriggerConfig {
    #[serde(default)]
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub trigger_data: Option<Value>,
}

impl ScheduleTriggerConfig {
    /// Whether the trigger is due at `now` given a poll window
    pub fn is_due(&self, now: DateTime<Utc>, window: Duration) -> Result<bool> {
        let window = TimeDelta::from_std(window)?;
        match self.schedule_type {
            ScheduleType::OneTime => {
                let scheduled = self
                    .scheduled_time
                    .ok_or_else(|| anyhow!("one-time schedule without scheduledTime"))?;
                Ok((now - scheduled).abs() < window)
            }
            ScheduleType::Recurring => {
                let expression = self
                    .cron_expression
                    .as_deref()
                    .ok_or_else(|| anyhow!("recurring schedule without cronExpression"))?;
                let Some(previous) = previous_occurrence(expression, now)? else {
                    return Ok(false);
                };
                let since = now - previous;
                Ok(since >= TimeDelta::zero() && since < window)
            }
        }
    }
}

/// Prepend a seconds field to 5-field Unix cron expressions
fn normalize_cron_expr(cron_expr: &str) -> String {
    if cron_expr.split_whitespace().count() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

/// Latest occurrence of `cron_expr` before `now`
pub fn previous_occurrence(cron_expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = Schedule::from_str(&normalize_cron_expr(cron_expr))
        .map_err(|e| anyhow!("Invalid cron expression '{}': {}", cron_expr, e))?;
    Ok(schedule.after(&now).next_back())
}

struct SchedulePoller {
    pipelines: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    window: Duration,
}

impl SchedulePoller {
    async fn poll(&self, now: DateTime<Utc>) -> usize {
        let pipelines = match self.pipelines.list_active_pipelines().await {
            Ok(pipelines) => pipelines,
            Err(e) => {
                tracing::error!("❌ Scheduler could not load pipelines: {}", e);
                return 0;
            }
        };

        let mut fired = 0;
        for pipeline in &pipelines {
            for node in schedule_triggers(pipeline) {
                if self.fire_if_due(pipeline, node, now).await {
                    fired += 1;
                }
            }
        }
        if fired > 0 {
            tracing::info!("⏰ Scheduler fired {} trigger(s) across {} pipelines", fired, pipelines.len());
        }
        fired
    }

    async fn fire_if_due(&self, pipeline: &Pipeline, node: &Node, now: DateTime<Utc>) -> bool {
        let config: ScheduleTriggerConfig = match serde_json::from_value(node.config.clone()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("⚠️ Invalid schedule config on {}/{}: {}", pipeline.id, node.id, e);
                return false;
            }
        };
        if !config.enabled {
            return false;
        }
        match config.is_due(now, self.window) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!("⚠️ Cannot evaluate schedule {}/{}: {}", pipeline.id, node.id, e);
                return false;
            }
        }

        let request = ExecutionRequest {
            pipeline_id: pipeline.id.clone(),
            user_id: pipeline.user_id.clone(),
            trigger: Trigger::scheduler(node.id.clone(), config.trigger_data),
        };
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("❌ Could not encode execution request for {}: {}", pipeline.id, e);
                return false;
            }
        };
        match self.queue.enqueue(EXECUTION_QUEUE, payload, JobOptions::default()).await {
            Ok(job_id) => {
                tracing::info!("🔔 Schedule trigger {}/{} fired (job {})", pipeline.id, node.id, job_id);
                true
            }
            Err(e) => {
                tracing::error!("❌ Failed to enqueue scheduled execution for {}: {}", pipeline.id, e);
                false
            }
        }
    }
}

/// Trigger nodes (no incoming edges) of the schedule type
fn schedule_triggers(pipeline: &Pipeline) -> impl Iterator<Item = &Node> {
    pipeline
        .trigger_nodes()
        .into_iter()
        .filter(|node| node.node_type == SCHEDULE_TRIGGER_TYPE)
}

/// Periodic scheduler service with explicit start/stop lifecycle
pub struct PipelineScheduler {
    poller: Arc<SchedulePoller>,
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid: RwLock<Option<Uuid>>,
}

impl PipelineScheduler {
    pub async fn new(pipelines: Arc<dyn PipelineStore>, queue: Arc<dyn JobQueue>, interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            poller: Arc::new(SchedulePoller {
                pipelines,
                queue,
                window: interval,
            }),
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid: RwLock::new(None),
        })
    }

    /// Poll once immediately, then every interval
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting pipeline scheduler (interval {:?})", self.poller.window);

        let mut job_uuid = self.job_uuid.write().await;
        if job_uuid.is_some() {
            tracing::debug!("Scheduler already started");
            return Ok(());
        }

        self.poller.poll(Utc::now()).await;

        let poller = Arc::clone(&self.poller);
        let job = Job::new_repeated_async(self.poller.window, move |_uuid, _l| {
            let poller = Arc::clone(&poller);
            Box::pin(async move {
                poller.poll(Utc::now()).await;
            })
        })?;

        let scheduler = self.scheduler.read().await;
        *job_uuid = Some(scheduler.add(job).await?);
        scheduler.start().await?;

        tracing::info!("✅ Pipeline scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping pipeline scheduler");
        let mut job_uuid = self.job_uuid.write().await;
        if let Some(uuid) = job_uuid.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove scheduler job {}: {}", uuid, e);
            }
        }
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        tracing::info!("✅ Pipeline scheduler stopped");
        Ok(())
    }

    /// Run one poll at `now`; returns the number of triggers fired
    pub async fn poll_once(&self, now: DateTime<Utc>) -> usize {
        self.poller.poll(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::pipeline::{Edge, EdgeCondition, InMemoryPipelineStore};
    use crate::queue::{InMemoryJobQueue, Job as QueueJob};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(60);

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn pipeline(id: &str, trigger_config: Value) -> Pipeline {
        Pipeline {
            id: id.to_string(),
            name: id.to_string(),
            user_id: "user-1".to_string(),
            active: true,
            nodes: vec![
                Node {
                    id: "tick".to_string(),
                    node_type: SCHEDULE_TRIGGER_TYPE.to_string(),
                    config: trigger_config,
                    field_mappings: Vec::new(),
                },
                Node {
                    id: "work".to_string(),
                    node_type: "log".to_string(),
                    config: Value::Null,
                    field_mappings: Vec::new(),
                },
            ],
            edges: vec![Edge {
                id: "e1".to_string(),
                source: "tick".to_string(),
                target: "work".to_string(),
                condition: EdgeCondition::immediate(),
            }],
        }
    }

    fn config(value: Value) -> ScheduleTriggerConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn one_time_fires_within_window() {
        let cfg = config(json!({
            "enabled": true,
            "scheduleType": "one-time",
            "scheduledTime": "2026-03-02T12:00:00Z"
        }));
        assert!(cfg.is_due(at(12, 0, 30), WINDOW).unwrap());
        assert!(cfg.is_due(at(11, 59, 30), WINDOW).unwrap());
        assert!(!cfg.is_due(at(12, 2, 0), WINDOW).unwrap());
    }

    #[test]
    fn recurring_fires_after_previous_occurrence() {
        let cfg = config(json!({
            "enabled": true,
            "scheduleType": "recurring",
            "cronExpression": "*/5 * * * *"
        }));
        assert!(cfg.is_due(at(12, 0, 30), WINDOW).unwrap());
        assert!(!cfg.is_due(at(12, 2, 30), WINDOW).unwrap());
        assert_eq!(previous_occurrence("*/5 * * * *", at(12, 7, 10)).unwrap(), Some(at(12, 5, 0)));
    }

    #[test]
    fn bad_schedules_are_errors() {
        let cfg = config(json!({ "enabled": true, "scheduleType": "recurring", "cronExpression": "nope" }));
        assert!(cfg.is_due(at(12, 0, 0), WINDOW).is_err());
        let cfg = config(json!({ "enabled": true, "scheduleType": "one-time" }));
        assert!(cfg.is_due(at(12, 0, 0), WINDOW).is_err());
    }

    #[tokio::test]
    async fn poll_enqueues_requests_for_due_enabled_triggers() {
        let store = Arc::new(InMemoryPipelineStore::new());
        store
            .insert(pipeline(
                "due",
                json!({
                    "enabled": true,
                    "scheduleType": "recurring",
                    "cronExpression": "0 * * * *",
                    "triggerData": { "source": "cron" }
                }),
            ))
            .await;
        store
            .insert(pipeline(
                "disabled",
                json!({ "enabled": false, "scheduleType": "recurring", "cronExpression": "0 * * * *" }),
            ))
            .await;
        let mut inactive = pipeline(
            "inactive",
            json!({ "enabled": true, "scheduleType": "recurring", "cronExpression": "0 * * * *" }),
        );
        inactive.active = false;
        store.insert(inactive).await;

        let queue = Arc::new(InMemoryJobQueue::new());
        let scheduler = PipelineScheduler::new(store, queue.clone(), WINDOW).await.unwrap();
        assert_eq!(scheduler.poll_once(at(12, 0, 20)).await, 1);

        let jobs = queue.outstanding(EXECUTION_QUEUE).await;
        assert_eq!(jobs.len(), 1);
        let request: ExecutionRequest = serde_json::from_value(jobs[0].payload.clone()).unwrap();
        assert_eq!(request.pipeline_id, "due");
        assert_eq!(request.user_id, "user-1");
        assert_eq!(request.trigger, Trigger::scheduler("tick", Some(json!({ "source": "cron" }))));

        // Not idempotent: a second poll inside the window fires again
        assert_eq!(scheduler.poll_once(at(12, 0, 40)).await, 1);
        assert_eq!(queue.outstanding(EXECUTION_QUEUE).await.len(), 2);
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, queue: &str, _payload: Value, _options: JobOptions) -> Result<String, QueueError> {
            Err(QueueError::Closed(queue.to_string()))
        }
        async fn get_job(&self, _job_id: &str) -> Result<Option<QueueJob>, QueueError> {
            Ok(None)
        }
        async fn remove_job(&self, job_id: &str) -> Result<(), QueueError> {
            Err(QueueError::JobNotFound(job_id.to_string()))
        }
        async fn release_delay(&self, job_id: &str) -> Result<(), QueueError> {
            Err(QueueError::JobNotFound(job_id.to_string()))
        }
    }

    #[tokio::test]
    async fn queue_errors_are_swallowed() {
        let store = Arc::new(InMemoryPipelineStore::new());
        store
            .insert(pipeline(
                "due",
                json!({ "enabled": true, "scheduleType": "one-time", "scheduledTime": "2026-03-02T12:00:00Z" }),
            ))
            .await;
        let scheduler = PipelineScheduler::new(store, Arc::new(BrokenQueue), WINDOW).await.unwrap();
        assert_eq!(scheduler.poll_once(at(12, 0, 0)).await, 0);
    }
}
