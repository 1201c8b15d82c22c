/// Pipewright: queue-backed execution engine for node-graph automation pipelines
///
/// Main entry point. Loads configuration from the environment and starts the HTTP
/// server together with the queue workers and the schedule-trigger poller.

use pipewright::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Pipeline management API at /api/pipelines/*
/// - Execution control at /api/executions/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
