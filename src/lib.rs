/// Pipewright: queue-backed execution engine for node-graph automation pipelines
///
/// This library runs user-defined pipelines: directed graphs of nodes whose edges
/// carry immediate, delayed, approval-gated or event conditions. Delays and approvals
/// are parked in a job queue and resumed by workers; schedule triggers are polled.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by the engine, queue and HTTP layer
pub mod error;

// SQLite bootstrap for pipelines and executions
pub mod database;

// Pipeline definitions and storage
pub mod pipeline;

// Execution records and storage
pub mod execution;

// Job queue and worker pool
pub mod queue;

// Runtime execution engine, scheduler and test runner
pub mod runtime;

// HTTP API layer - REST endpoints for pipelines and executions
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use execution::{Execution, ExecutionStatus, NodeResult, NodeStatus, Trigger};
pub use pipeline::{Edge, EdgeCondition, Node, Pipeline};
pub use runtime::{ExecutionEngine, NodeHandler, PipelineTester};
pub use server::start_server;
