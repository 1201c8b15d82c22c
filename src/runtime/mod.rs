/// Runtime Execution Engine
///
/// This module drives pipeline executions. It handles:
/// - Dispatching nodes with claim-based deduplication
/// - Edge condition evaluation (immediate, delay, approval, event)
/// - Input resolution and template rendering before each node runs
/// - Polling schedule triggers and starting executions through the job queue
/// - Pre-flight validation and in-process test runs

// Edge condition evaluation
pub mod conditions;

// Core execution engine
pub mod engine;

// Node handler trait and registry
pub mod executor;

// Built-in node handlers
pub mod handlers;

// Field mappings and transforms
pub mod inputs;

// Queue payloads and worker handlers
pub mod jobs;

// Lua expression sandbox
pub mod sandbox;

// Background poller for schedule-trigger nodes
pub mod scheduler;

// {{placeholder}} rendering
pub mod template;

// Validation and test runs
pub mod testing;

// Re-export main types
pub use engine::ExecutionEngine;
pub use executor::{NodeExecutorRegistry, NodeHandler};
pub use jobs::{ExecutionRequest, ExecutionStartHandler, NodeJobHandler, NodeJobPayload};
pub use sandbox::ExpressionSandbox;
pub use scheduler::PipelineScheduler;
pub use testing::{validate, PipelineTester, TestMode, TestRunReport, ValidationIssue};
