/// Server setup and initialization
///
/// Wires together all components: stores, job queue workers, execution engine,
/// scheduler, and HTTP routes.

use crate::{
    api::{create_execution_routes, create_pipeline_routes, AppState},
    config::Config,
    database,
    execution::SqliteExecutionStore,
    pipeline::SqlitePipelineStore,
    queue::{InMemoryJobQueue, QueueWorker, WorkerOptions, EXECUTION_QUEUE, NODE_QUEUE},
    runtime::{
        ExecutionEngine, ExecutionStartHandler, ExpressionSandbox, NodeExecutorRegistry, NodeJobHandler,
        PipelineScheduler, PipelineTester,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// The HTTP router plus the background services running behind it
pub struct Application {
    pub router: Router,
    pub engine: Arc<ExecutionEngine>,
    pub queue: Arc<InMemoryJobQueue>,
    workers: Vec<QueueWorker>,
    scheduler: Arc<PipelineScheduler>,
}

impl Application {
    /// Stop the scheduler, then drain both queue workers
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.scheduler.stop().await {
            tracing::warn!("⚠️ Scheduler did not stop cleanly: {}", e);
        }
        for worker in self.workers {
            let queue_name = worker.queue_name().to_string();
            worker.shutdown().await?;
            tracing::info!("✅ Worker for '{}' stopped", queue_name);
        }
        Ok(())
    }
}

/// Create the application with all routes and background services
///
/// Opens the database, builds the engine, starts one worker per queue and the
/// schedule-trigger poller.
pub async fn create_app(config: Config) -> Result<Application> {
    tracing::info!("🏗️ Initializing storage in {}", config.database.data_dir);
    let pool = database::connect(&config.database.data_dir).await?;
    let pipeline_store = Arc::new(SqlitePipelineStore::new(pool.clone()));
    let execution_store = Arc::new(SqliteExecutionStore::new(pool));

    let queue = Arc::new(InMemoryJobQueue::new());
    let sandbox = ExpressionSandbox::new();
    let executors = Arc::new(NodeExecutorRegistry::with_builtins(sandbox.clone()));

    tracing::info!("🚀 Initializing execution engine ({:?})", config.engine.failure_policy);
    let engine = Arc::new(
        ExecutionEngine::new(
            pipeline_store.clone(),
            execution_store,
            queue.clone(),
            Arc::clone(&executors),
            config.engine.clone(),
        )
        .with_sandbox(sandbox),
    );
    let tester = Arc::new(PipelineTester::new(executors, config.engine.clone()));

    tracing::info!(
        "👷 Starting queue workers (concurrency {}, {} jobs/s)",
        config.queue.concurrency,
        config.queue.rate_limit_per_sec
    );
    let workers = vec![
        QueueWorker::start(
            Arc::clone(&queue),
            NODE_QUEUE,
            Arc::new(NodeJobHandler::new(Arc::clone(&engine))),
            WorkerOptions::from(&config.queue),
        ),
        QueueWorker::start(
            Arc::clone(&queue),
            EXECUTION_QUEUE,
            Arc::new(ExecutionStartHandler::new(Arc::clone(&engine))),
            WorkerOptions::from(&config.queue),
        ),
    ];

    let scheduler = Arc::new(
        PipelineScheduler::new(
            pipeline_store.clone(),
            queue.clone(),
            Duration::from_secs(config.scheduler.interval_secs.max(1)),
        )
        .await?,
    );
    scheduler.start().await?;

    let state = AppState {
        engine: Arc::clone(&engine),
        tester,
        pipelines: pipeline_store,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_pipeline_routes())
        .merge(create_execution_routes())
        .with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(Application {
        router,
        engine,
        queue,
        workers,
        scheduler,
    })
}

/// Start the HTTP server with the given configuration
///
/// Runs until Ctrl-C, then stops accepting requests and drains the workers.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting pipewright server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down background services");
    app.shutdown().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

async fn health_check() -> &'static str {
    "ok"
}
