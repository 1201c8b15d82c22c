/// Configuration management for the pipewright engine
///
/// Handles server configuration, database location, queue worker limits,
/// scheduler cadence, and engine policy knobs. Every value has an env var override
/// for container deployment.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Job queue worker configuration
    pub queue: QueueConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Engine policy configuration
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `pipewright.db` (default: "data")
    pub data_dir: String,
}

/// Worker pool limits and retry behaviour applied to every queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs running concurrently per queue
    pub concurrency: usize,
    /// Maximum jobs started per second per queue
    pub rate_limit_per_sec: u32,
    /// Attempts per job, including the first one
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff
    pub backoff_base_ms: u64,
    /// Fallback wakeup interval for idle workers
    pub idle_poll_ms: u64,
}

/// Time-based trigger polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll interval, also used as the fire window
    pub interval_secs: u64,
}

/// What happens to an execution when one of its nodes fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failed node fails the whole execution
    #[default]
    FailFast,
    /// Sibling branches keep running; downstream of the failure is skipped
    ContinueOnError,
}

/// How queue job ids are derived for an edge type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobIdPolicy {
    /// Timestamped ids, re-triggering schedules another job
    Unique,
    /// One id per (execution, node), at most one outstanding job
    Deterministic,
}

/// Engine policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub failure_policy: FailurePolicy,
    pub delay_job_ids: JobIdPolicy,
    pub approval_job_ids: JobIdPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            delay_job_ids: JobIdPolicy::Unique,
            approval_job_ids: JobIdPolicy::Deterministic,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_per_sec: 10,
            max_attempts: 3,
            backoff_base_ms: 1000,
            idle_poll_ms: 500,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "continue" | "continue_on_error" => Ok(Self::ContinueOnError),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

impl FromStr for JobIdPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unique" => Ok(Self::Unique),
            "deterministic" => Ok(Self::Deterministic),
            other => Err(format!("unknown job id policy: {other}")),
        }
    }
}

/// Read an env var and parse it, falling back to `default` when unset or malformed
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring malformed {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let queue = QueueConfig::default();
        let engine = EngineConfig::default();
        Self {
            server: ServerConfig {
                host: std::env::var("PIPEWRIGHT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("PIPEWRIGHT_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("PIPEWRIGHT_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            queue: QueueConfig {
                concurrency: env_or("PIPEWRIGHT_WORKER_CONCURRENCY", queue.concurrency),
                rate_limit_per_sec: env_or("PIPEWRIGHT_WORKER_RATE_LIMIT", queue.rate_limit_per_sec),
                max_attempts: env_or("PIPEWRIGHT_JOB_ATTEMPTS", queue.max_attempts),
                backoff_base_ms: env_or("PIPEWRIGHT_JOB_BACKOFF_MS", queue.backoff_base_ms),
                idle_poll_ms: queue.idle_poll_ms,
            },
            scheduler: SchedulerConfig {
                interval_secs: env_or("PIPEWRIGHT_SCHEDULER_INTERVAL_SECS", 60),
            },
            engine: EngineConfig {
                failure_policy: env_or("PIPEWRIGHT_FAILURE_POLICY", engine.failure_policy),
                delay_job_ids: env_or("PIPEWRIGHT_DELAY_JOB_IDS", engine.delay_job_ids),
                approval_job_ids: env_or("PIPEWRIGHT_APPROVAL_JOB_IDS", engine.approval_job_ids),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_from_env_spelling() {
        assert_eq!("fail_fast".parse::<FailurePolicy>(), Ok(FailurePolicy::FailFast));
        assert_eq!("continue".parse::<FailurePolicy>(), Ok(FailurePolicy::ContinueOnError));
        assert_eq!("deterministic".parse::<JobIdPolicy>(), Ok(JobIdPolicy::Deterministic));
        assert!("sometimes".parse::<JobIdPolicy>().is_err());
    }

    #[test]
    fn engine_defaults_keep_approval_ids_deterministic() {
        let engine = EngineConfig::default();
        assert_eq!(engine.failure_policy, FailurePolicy::FailFast);
        assert_eq!(engine.delay_job_ids, JobIdPolicy::Unique);
        assert_eq!(engine.approval_job_ids, JobIdPolicy::Deterministic);
    }
}
