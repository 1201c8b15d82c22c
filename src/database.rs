/// SQLite bootstrap for pipeline and execution storage
///
/// One database file holds both pipeline definitions and execution records.
/// Node results and log lines live in their own tables so that every engine write
/// is a single-row statement (per-key upsert or append), never a document rewrite.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Open (creating if needed) `{data_dir}/pipewright.db` and initialise its schema
pub async fn connect(data_dir: &str) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
    let db_path = Path::new(data_dir).join("pipewright.db");

    tracing::info!("🗄️ Opening database: {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    init_schema(&pool).await?;

    tracing::info!("✅ Database ready: {}", db_path.display());
    Ok(pool)
}

/// Private in-memory database; a single connection so every query sees the same data
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes. Safe to call multiple times.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            definition JSON NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            pipeline_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger JSON NOT NULL,
            current_node_id TEXT,
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_node_results (
            execution_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            output JSON,
            error TEXT,
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            edge_condition JSON,
            pending_approval INTEGER NOT NULL DEFAULT 0,
            approval_job_id TEXT,
            delay_job_id TEXT,
            PRIMARY KEY (execution_id, node_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_logs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            line TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_pipeline ON executions(pipeline_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_execution_logs_execution ON execution_logs(execution_id, seq)")
        .execute(pool)
        .await?;

    Ok(())
}
