/// `{{name}}` placeholder rendering for node configuration
///
/// Placeholders resolve against the node's resolved inputs by dot path. A placeholder
/// that does not resolve is left in the output verbatim.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("placeholder pattern compiles")
    })
}

/// Look `path` up in `inputs` ("user.name", "items.0")
pub fn lookup<'a>(inputs: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = inputs.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(object) => object.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render every placeholder in `template`. Strings are inserted as-is, other values as JSON.
pub fn render_str(template: &str, inputs: &Map<String, Value>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &Captures| match lookup(inputs, &caps[1]) {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render every string inside `config`, recursing through arrays and objects
pub fn render_value(config: &Value, inputs: &Map<String, Value>) -> Value {
    match config {
        Value::String(text) => Value::String(render_str(text, inputs)),
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(item, inputs)).collect()),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| (key.clone(), render_value(value, inputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}
