/// Node executor registry
///
/// Maps a node's declared type to the handler that runs it. Handlers receive the node
/// with its configuration already rendered, the current execution (read-only), and the
/// resolved inputs. They may be retried and must not write to the execution.

use crate::execution::Execution;
use crate::pipeline::Node;
use crate::runtime::handlers::{ConditionHandler, DataTransformHandler, LogHandler, TriggerHandler};
use crate::runtime::sandbox::ExpressionSandbox;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, node: &Node, execution: &Execution, inputs: &Map<String, Value>) -> Result<Value>;
}

#[derive(Default)]
pub struct NodeExecutorRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeExecutorRegistry {
    /// Empty registry; every node type must be registered explicitly
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in trigger, transform, condition and log handlers
    pub fn with_builtins(sandbox: ExpressionSandbox) -> Self {
        let trigger: Arc<dyn NodeHandler> = Arc::new(TriggerHandler);
        let mut registry = Self::new();
        registry
            .register("manual-trigger", Arc::clone(&trigger))
            .register("webhook-trigger", Arc::clone(&trigger))
            .register("schedule-trigger", trigger)
            .register("data-transform", Arc::new(DataTransformHandler::new(sandbox.clone())))
            .register("condition", Arc::new(ConditionHandler::new(sandbox)))
            .register("log", Arc::new(LogHandler));
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(node_type.into(), handler);
        self
    }

    pub fn supports(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    pub async fn execute(&self, node: &Node, execution: &Execution, inputs: &Map<String, Value>) -> Result<Value> {
        let handler = self
            .handlers
            .get(&node.node_type)
            .ok_or_else(|| anyhow!("No executor registered for node type '{}'", node.node_type))?;

        tracing::debug!("🚀 Executing node {} (type: {})", node.id, node.node_type);
        let start_time = std::time::Instant::now();
        let result = handler.execute(node, execution, inputs).await;
        match &result {
            Ok(_) => tracing::debug!("✅ Node {} handler returned in {:?}", node.id, start_time.elapsed()),
            Err(e) => tracing::debug!("❌ Node {} handler failed in {:?}: {}", node.id, start_time.elapsed(), e),
        }
        result
    }
}
