/// Field-mapping resolution
///
/// Builds a node's input map from upstream outputs. A mapping whose source output or
/// field is missing is skipped with a notice; only a failing `custom` expression is an
/// error.

use crate::pipeline::{FieldMapping, Node, Transform};
use crate::runtime::sandbox::ExpressionSandbox;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct ResolvedInputs {
    pub values: Map<String, Value>,
    /// One line per mapping that was skipped
    pub notices: Vec<String>,
}

pub fn resolve_inputs<'a, F>(node: &Node, output_of: F, sandbox: &ExpressionSandbox) -> Result<ResolvedInputs>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    let mut resolved = ResolvedInputs::default();

    for mapping in &node.field_mappings {
        let Some(output) = output_of(&mapping.source_node_id) else {
            let notice = format!(
                "No output from '{}' for mapping to '{}', skipped",
                mapping.source_node_id, mapping.target_field
            );
            tracing::warn!(node_id = %node.id, "⚠️ {}", notice);
            resolved.notices.push(notice);
            continue;
        };

        let Some(value) = extract_field(output, &mapping.source_field) else {
            let notice = format!(
                "Field '{}' missing in output of '{}', mapping to '{}' skipped",
                mapping.source_field, mapping.source_node_id, mapping.target_field
            );
            tracing::warn!(node_id = %node.id, "⚠️ {}", notice);
            resolved.notices.push(notice);
            continue;
        };

        let value = apply_transform(mapping, value, sandbox)?;
        tracing::debug!(node_id = %node.id, "🔌 {} <- {}.{} = {}", mapping.target_field, mapping.source_node_id, mapping.source_field, value);
        assign(&mut resolved.values, &mapping.target_field, value);
    }

    Ok(resolved)
}

/// Read a field from an output: JSONPath when the path starts with `$`, dot path otherwise
pub fn extract_field(output: &Value, path: &str) -> Option<Value> {
    if path.starts_with('$') {
        let matches = jsonpath_lib::select(output, path).ok()?;
        return match matches.len() {
            0 => None,
            1 => Some(matches[0].clone()),
            _ => Some(Value::Array(matches.into_iter().cloned().collect())),
        };
    }

    if path.is_empty() {
        return Some(output.clone());
    }

    let mut current = output;
    for part in path.split('.') {
        current = match current {
            Value::Object(object) => object.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

pub fn apply_transform(mapping: &FieldMapping, value: Value, sandbox: &ExpressionSandbox) -> Result<Value> {
    Ok(match mapping.transform {
        Transform::None => value,
        Transform::Stringify => match value {
            Value::String(_) => value,
            other => Value::String(other.to_string()),
        },
        Transform::Parse => match &value {
            Value::String(text) => serde_json::from_str(text).unwrap_or(value),
            _ => value,
        },
        Transform::Uppercase => match value {
            Value::String(text) => Value::String(text.to_uppercase()),
            other => other,
        },
        Transform::Lowercase => match value {
            Value::String(text) => Value::String(text.to_lowercase()),
            other => other,
        },
        Transform::Custom => {
            let expression = mapping
                .expression
                .as_deref()
                .filter(|expr| !expr.trim().is_empty())
                .ok_or_else(|| anyhow!("custom transform for '{}' has no expression", mapping.target_field))?;
            sandbox
                .eval_value(expression, &value)
                .map_err(|e| anyhow!("custom transform for '{}' failed: {}", mapping.target_field, e))?
        }
    })
}

/// Insert at a dot path, creating intermediate objects
fn assign(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                assign(child, rest, value);
            }
        }
    }
}
