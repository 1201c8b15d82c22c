/// Execution persistence
///
/// Every write the engine performs is one of: create, append a log line, upsert one
/// NodeResult by node id, claim one NodeResult, or patch top-level scalar fields.
/// Both implementations apply each of these atomically for a single key, so two workers
/// finishing sibling branches never overwrite each other's results.

use crate::execution::types::{
    Execution, ExecutionPatch, ExecutionStatus, NodeResult, NodeResultPatch, NodeStatus, Trigger,
};
use crate::pipeline::EdgeCondition;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, execution: &Execution) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Execution>>;

    /// Create-or-patch one NodeResult; returns the stored result
    async fn upsert_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
        patch: NodeResultPatch,
    ) -> Result<NodeResult>;

    /// Compare-and-swap a NodeResult into `running`, creating it when absent.
    /// Returns false when another dispatch already owns (or finished) the node.
    async fn claim_node(
        &self,
        execution_id: &str,
        node_id: &str,
        edge_condition: Option<EdgeCondition>,
        started_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn append_log(&self, execution_id: &str, line: &str) -> Result<()>;

    async fn update_fields(&self, execution_id: &str, patch: ExecutionPatch) -> Result<()>;

    /// Apply `patch` only while the current status is one of `allowed`
    async fn update_fields_if(
        &self,
        execution_id: &str,
        allowed: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> Result<bool>;
}

/// Process-local store; each operation holds the write lock for one key only
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            anyhow::bail!("execution already exists: {}", execution.id);
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn upsert_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
        patch: NodeResultPatch,
    ) -> Result<NodeResult> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .with_context(|| format!("execution not found: {execution_id}"))?;
        let result = execution
            .node_results
            .entry(node_id.to_string())
            .or_insert_with(|| NodeResult::pending(node_id));
        result.apply(&patch);
        Ok(result.clone())
    }

    async fn claim_node(
        &self,
        execution_id: &str,
        node_id: &str,
        edge_condition: Option<EdgeCondition>,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .with_context(|| format!("execution not found: {execution_id}"))?;
        let result = execution
            .node_results
            .entry(node_id.to_string())
            .or_insert_with(|| NodeResult::pending(node_id));
        if !result.is_claimable() {
            return Ok(false);
        }
        result.apply(&NodeResultPatch {
            status: Some(NodeStatus::Running),
            started_at: Some(started_at),
            edge_condition,
            pending_approval: Some(false),
            ..NodeResultPatch::default()
        });
        Ok(true)
    }

    async fn append_log(&self, execution_id: &str, line: &str) -> Result<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .with_context(|| format!("execution not found: {execution_id}"))?;
        execution.logs.push(line.to_string());
        Ok(())
    }

    async fn update_fields(&self, execution_id: &str, patch: ExecutionPatch) -> Result<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .with_context(|| format!("execution not found: {execution_id}"))?;
        patch.apply(execution);
        Ok(())
    }

    async fn update_fields_if(
        &self,
        execution_id: &str,
        allowed: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> Result<bool> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .with_context(|| format!("execution not found: {execution_id}"))?;
        if !allowed.contains(&execution.status) {
            return Ok(false);
        }
        patch.apply(execution);
        Ok(true)
    }
}

/// SQLite-backed store; node results and log lines are rows, never embedded documents
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_node_result(&self, execution_id: &str, node_id: &str) -> Result<NodeResult> {
        let row = sqlx::query("SELECT * FROM execution_node_results WHERE execution_id = ? AND node_id = ?")
            .bind(execution_id)
            .bind(node_id)
            .fetch_one(&self.pool)
            .await?;
        node_result_from_row(&row)
    }
}

fn to_text(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339())
}

fn from_text(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("invalid timestamp in store: {s}"))
    })
    .transpose()
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn node_result_from_row(row: &SqliteRow) -> Result<NodeResult> {
    let status: String = row.try_get("status")?;
    Ok(NodeResult {
        node_id: row.try_get("node_id")?,
        status: status.parse()?,
        output: from_json(row.try_get("output")?)?,
        error: row.try_get("error")?,
        started_at: from_text(row.try_get("started_at")?)?,
        finished_at: from_text(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
        edge_condition: from_json(row.try_get("edge_condition")?)?,
        pending_approval: row.try_get("pending_approval")?,
        approval_job_id: row.try_get("approval_job_id")?,
        delay_job_id: row.try_get("delay_job_id")?,
    })
}

fn status_list(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions
                (id, pipeline_id, user_id, status, trigger, current_node_id, started_at, finished_at, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.pipeline_id)
        .bind(&execution.user_id)
        .bind(execution.status.as_str())
        .bind(serde_json::to_string(&execution.trigger)?)
        .bind(&execution.current_node_id)
        .bind(to_text(execution.started_at))
        .bind(to_text(execution.finished_at))
        .bind(execution.duration_ms)
        .bind(execution.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for line in &execution.logs {
            sqlx::query("INSERT INTO execution_logs (execution_id, line) VALUES (?, ?)")
                .bind(&execution.id)
                .bind(line)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        for result in execution.node_results.values() {
            let patch = NodeResultPatch {
                status: Some(result.status),
                output: result.output.clone(),
                error: result.error.clone(),
                started_at: result.started_at,
                finished_at: result.finished_at,
                duration_ms: result.duration_ms,
                edge_condition: result.edge_condition.clone(),
                pending_approval: Some(result.pending_approval),
                approval_job_id: result.approval_job_id.clone(),
                delay_job_id: result.delay_job_id.clone(),
            };
            self.upsert_node_result(&execution.id, &result.node_id, patch).await?;
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Execution>> {
        let Some(row) = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let trigger: String = row.try_get("trigger")?;
        let created_at: String = row.try_get("created_at")?;

        let result_rows = sqlx::query("SELECT * FROM execution_node_results WHERE execution_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let mut node_results = HashMap::with_capacity(result_rows.len());
        for result_row in &result_rows {
            let result = node_result_from_row(result_row)?;
            node_results.insert(result.node_id.clone(), result);
        }

        let logs: Vec<String> = sqlx::query("SELECT line FROM execution_logs WHERE execution_id = ? ORDER BY seq")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|log_row| log_row.get("line"))
            .collect();

        Ok(Some(Execution {
            id: row.try_get("id")?,
            pipeline_id: row.try_get("pipeline_id")?,
            user_id: row.try_get("user_id")?,
            status: status.parse()?,
            trigger: serde_json::from_str::<Trigger>(&trigger)?,
            node_results,
            current_node_id: row.try_get("current_node_id")?,
            started_at: from_text(row.try_get("started_at")?)?,
            finished_at: from_text(row.try_get("finished_at")?)?,
            duration_ms: row.try_get("duration_ms")?,
            logs,
            created_at: from_text(Some(created_at))?.unwrap_or_else(Utc::now),
        }))
    }

    async fn upsert_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
        patch: NodeResultPatch,
    ) -> Result<NodeResult> {
        sqlx::query(
            r#"
            INSERT INTO execution_node_results
                (execution_id, node_id, status, output, error, started_at, finished_at, duration_ms,
                 edge_condition, pending_approval, approval_job_id, delay_job_id)
            VALUES (?1, ?2, COALESCE(?3, 'pending'), ?4, ?5, ?6, ?7, ?8, ?9, COALESCE(?10, 0), ?11, ?12)
            ON CONFLICT(execution_id, node_id) DO UPDATE SET
                status = COALESCE(?3, execution_node_results.status),
                output = COALESCE(?4, execution_node_results.output),
                error = COALESCE(?5, execution_node_results.error),
                started_at = COALESCE(?6, execution_node_results.started_at),
                finished_at = COALESCE(?7, execution_node_results.finished_at),
                duration_ms = COALESCE(?8, execution_node_results.duration_ms),
                edge_condition = COALESCE(?9, execution_node_results.edge_condition),
                pending_approval = COALESCE(?10, execution_node_results.pending_approval),
                approval_job_id = COALESCE(?11, execution_node_results.approval_job_id),
                delay_job_id = COALESCE(?12, execution_node_results.delay_job_id)
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(patch.status.map(|status| status.as_str()))
        .bind(to_json(patch.output.as_ref())?)
        .bind(patch.error)
        .bind(to_text(patch.started_at))
        .bind(to_text(patch.finished_at))
        .bind(patch.duration_ms)
        .bind(to_json(patch.edge_condition.as_ref())?)
        .bind(patch.pending_approval)
        .bind(patch.approval_job_id)
        .bind(patch.delay_job_id)
        .execute(&self.pool)
        .await?;

        self.load_node_result(execution_id, node_id).await
    }

    async fn claim_node(
        &self,
        execution_id: &str,
        node_id: &str,
        edge_condition: Option<EdgeCondition>,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_node_results
                (execution_id, node_id, status, started_at, edge_condition, pending_approval)
            VALUES (?1, ?2, 'running', ?3, ?4, 0)
            ON CONFLICT(execution_id, node_id) DO UPDATE SET
                status = 'running',
                started_at = ?3,
                edge_condition = COALESCE(?4, execution_node_results.edge_condition),
                pending_approval = 0
            WHERE execution_node_results.status IN ('pending', 'delayed')
               OR (execution_node_results.status = 'waiting_approval' AND execution_node_results.pending_approval = 0)
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(started_at.to_rfc3339())
        .bind(to_json(edge_condition.as_ref())?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_log(&self, execution_id: &str, line: &str) -> Result<()> {
        sqlx::query("INSERT INTO execution_logs (execution_id, line) VALUES (?, ?)")
            .bind(execution_id)
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_fields(&self, execution_id: &str, patch: ExecutionPatch) -> Result<()> {
        if !self.update_fields_if(execution_id, &[], patch).await? {
            anyhow::bail!("execution not found: {}", execution_id);
        }
        Ok(())
    }

    async fn update_fields_if(
        &self,
        execution_id: &str,
        allowed: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> Result<bool> {
        // An empty allow-list means unconditional
        let guard = if allowed.is_empty() {
            String::new()
        } else {
            format!(" AND status IN ({})", status_list(allowed))
        };
        let sql = format!(
            r#"
            UPDATE executions SET
                status = COALESCE(?2, status),
                current_node_id = COALESCE(?3, current_node_id),
                started_at = COALESCE(?4, started_at),
                finished_at = COALESCE(?5, finished_at),
                duration_ms = COALESCE(?6, duration_ms)
            WHERE id = ?1{guard}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(execution_id)
            .bind(patch.status.map(|status| status.as_str()))
            .bind(patch.current_node_id)
            .bind(to_text(patch.started_at))
            .bind(to_text(patch.finished_at))
            .bind(patch.duration_ms)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
