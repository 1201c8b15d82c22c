/// Pipeline persistence
///
/// Pipelines are stored as JSON with a few indexed columns for listing and for the
/// scheduler's "active pipelines" scan.

use crate::pipeline::types::Pipeline;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read access the engine, scheduler and tester need
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>>;

    /// All pipelines not explicitly deactivated
    async fn list_active_pipelines(&self) -> Result<Vec<Pipeline>>;
}

/// SQLite-based pipeline storage
#[derive(Debug, Clone)]
pub struct SqlitePipelineStore {
    pool: SqlitePool,
}

impl SqlitePipelineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new pipeline or update an existing one (UPSERT)
    pub async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let definition_json = serde_json::to_string(pipeline)?;

        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, user_id, active, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                user_id = excluded.user_id,
                active = excluded.active,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&pipeline.id)
        .bind(&pipeline.name)
        .bind(&pipeline.user_id)
        .bind(pipeline.active)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List all pipelines with basic metadata
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, user_id, active, created_at, updated_at FROM pipelines ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pipelines = Vec::new();
        for row in rows {
            pipelines.push(PipelineMetadata {
                id: row.get("id"),
                name: row.get("name"),
                user_id: row.get("user_id"),
                active: row.get("active"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(pipelines)
    }

    /// Delete a pipeline by ID. Executions are kept; retention is a store policy.
    pub async fn delete_pipeline(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PipelineStore for SqlitePipelineStore {
    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        let row = sqlx::query("SELECT definition FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active_pipelines(&self) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query("SELECT definition FROM pipelines WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;

        let mut pipelines = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            pipelines.push(serde_json::from_str(&definition_json)?);
        }
        Ok(pipelines)
    }
}

/// Basic pipeline metadata for listing operations
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetadata {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Process-local pipeline store for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    pipelines: RwLock<HashMap<String, Pipeline>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, pipeline: Pipeline) {
        self.pipelines.write().await.insert(pipeline.id.clone(), pipeline);
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(id).cloned())
    }

    async fn list_active_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self
            .pipelines
            .read()
            .await
            .values()
            .filter(|pipeline| pipeline.active)
            .cloned()
            .collect())
    }
}
