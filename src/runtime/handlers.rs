/// Built-in node handlers
///
/// Business handlers (HTTP fetch, chain reads and writes, ...) are registered by the
/// embedding application. The handlers here cover the engine's own node types.

use crate::execution::Execution;
use crate::pipeline::Node;
use crate::runtime::executor::NodeHandler;
use crate::runtime::sandbox::ExpressionSandbox;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// `manual-trigger`, `webhook-trigger`, `schedule-trigger`: emit the trigger payload
pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    async fn execute(&self, node: &Node, execution: &Execution, _inputs: &Map<String, Value>) -> Result<Value> {
        tracing::debug!("🎯 Trigger node {} fired by {}", node.id, execution.trigger.trigger_type);
        Ok(execution.trigger.data.clone().unwrap_or_else(|| json!({})))
    }
}

/// `data-transform`: run `config.script` with `inputs` and `trigger` bound
///
/// ```json
/// { "script": "return { total = inputs.price * inputs.qty }" }
/// ```
pub struct DataTransformHandler {
    sandbox: ExpressionSandbox,
}

impl DataTransformHandler {
    pub fn new(sandbox: ExpressionSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl NodeHandler for DataTransformHandler {
    async fn execute(&self, node: &Node, execution: &Execution, inputs: &Map<String, Value>) -> Result<Value> {
        let script = node
            .config
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("data-transform node '{}' missing 'script'", node.id))?;
        tracing::debug!("📝 Lua script for {}: {}", node.id, script);

        let inputs = Value::Object(inputs.clone());
        let trigger = execution.trigger.data.clone().unwrap_or(Value::Null);
        self.sandbox
            .run_script(script, &[("inputs", &inputs), ("trigger", &trigger)])
    }
}

/// `condition`: evaluate `config.expression`, output `{ "result": bool }` with Lua truthiness
pub struct ConditionHandler {
    sandbox: ExpressionSandbox,
}

impl ConditionHandler {
    pub fn new(sandbox: ExpressionSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, node: &Node, _execution: &Execution, inputs: &Map<String, Value>) -> Result<Value> {
        let expression = node
            .config
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("condition node '{}' missing 'expression'", node.id))?;

        let inputs = Value::Object(inputs.clone());
        let value = self.sandbox.eval_expression(expression, &[("inputs", &inputs)])?;
        let result = !matches!(value, Value::Null | Value::Bool(false));
        tracing::debug!("🔀 Condition {} evaluated to {}", node.id, result);
        Ok(json!({ "result": result }))
    }
}

/// `log`: echo the rendered `config.message` and the inputs
pub struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    async fn execute(&self, node: &Node, execution: &Execution, inputs: &Map<String, Value>) -> Result<Value> {
        let message = node
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::info!(execution_id = %execution.id, node_id = %node.id, "📋 {}", message);
        Ok(json!({ "message": message, "inputs": inputs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Trigger;

    fn node(node_type: &str, config: Value) -> Node {
        Node {
            id: "n".to_string(),
            node_type: node_type.to_string(),
            config,
            field_mappings: Vec::new(),
        }
    }

    fn inputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn data_transform_sees_inputs_and_trigger() {
        let handler = DataTransformHandler::new(ExpressionSandbox::new());
        let execution = Execution::new("p", "u", Trigger::manual(Some(json!({ "qty": 3 }))));
        let out = handler
            .execute(
                &node("data-transform", json!({ "script": "return { total = inputs.price * trigger.qty }" })),
                &execution,
                &inputs(json!({ "price": 5 })),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({ "total": 15 }));
    }

    #[tokio::test]
    async fn condition_uses_lua_truthiness() {
        let handler = ConditionHandler::new(ExpressionSandbox::new());
        let execution = Execution::new("p", "u", Trigger::manual(None));
        let check = |expr: &str| node("condition", json!({ "expression": expr }));

        let out = handler.execute(&check("inputs.price > 10"), &execution, &inputs(json!({ "price": 12 }))).await.unwrap();
        assert_eq!(out, json!({ "result": true }));
        let out = handler.execute(&check("inputs.missing"), &execution, &Map::new()).await.unwrap();
        assert_eq!(out, json!({ "result": false }));
        let out = handler.execute(&check("0"), &execution, &Map::new()).await.unwrap();
        assert_eq!(out, json!({ "result": true }));
    }

    #[tokio::test]
    async fn missing_config_is_an_error() {
        let execution = Execution::new("p", "u", Trigger::manual(None));
        let transform = DataTransformHandler::new(ExpressionSandbox::new());
        assert!(transform.execute(&node("data-transform", json!({})), &execution, &Map::new()).await.is_err());
        let condition = ConditionHandler::new(ExpressionSandbox::new());
        assert!(condition.execute(&node("condition", json!({})), &execution, &Map::new()).await.is_err());
    }
}
