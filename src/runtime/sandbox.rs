/// Restricted Lua evaluation for user expressions
///
/// Used by `custom` field-mapping transforms and by the `data-transform` and
/// `condition` node handlers. Each evaluation gets a fresh Lua state with only the
/// math, string and table libraries, no code loading, no metatable access, a memory
/// cap, and a wall-clock deadline checked from an instruction hook.

use anyhow::{anyhow, Result};
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Base-library globals removed from every sandbox state
const BLOCKED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "require",
    "rawset",
    "rawget",
    "rawequal",
    "setmetatable",
    "getmetatable",
    "collectgarbage",
    "print",
];

const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

#[derive(Debug, Clone)]
pub struct ExpressionSandbox {
    memory_limit: usize,
    timeout: Duration,
}

impl Default for ExpressionSandbox {
    fn default() -> Self {
        Self {
            memory_limit: 16 * 1024 * 1024,
            timeout: Duration::from_millis(250),
        }
    }
}

impl ExpressionSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(memory_limit: usize, timeout: Duration) -> Self {
        Self { memory_limit, timeout }
    }

    /// Evaluate a single expression against one value bound as `value`
    pub fn eval_value(&self, expression: &str, value: &Value) -> Result<Value> {
        self.eval_expression(expression, &[("value", value)])
    }

    /// Evaluate an expression; `return` is implied when the source has none
    pub fn eval_expression(&self, expression: &str, bindings: &[(&str, &Value)]) -> Result<Value> {
        let source = if expression.contains("return") {
            expression.to_string()
        } else {
            format!("return {}", expression)
        };
        self.run_script(&source, bindings)
    }

    /// Run a Lua chunk and convert its first return value to JSON
    pub fn run_script(&self, script: &str, bindings: &[(&str, &Value)]) -> Result<Value> {
        let lua = self.state()?;
        let globals = lua.globals();
        for (name, value) in bindings {
            let options = SerializeOptions::new()
                .serialize_none_to_null(false)
                .serialize_unit_to_null(false);
            let lua_value = lua
                .to_value_with(*value, options)
                .map_err(|e| anyhow!("Failed to bind '{}' into sandbox: {}", name, e))?;
            globals
                .set(*name, lua_value)
                .map_err(|e| anyhow!("Failed to bind '{}' into sandbox: {}", name, e))?;
        }

        let result = lua
            .load(script)
            .set_name("expression")
            .eval::<mlua::Value>()
            .map_err(|e| anyhow!("Sandboxed expression failed: {}", e))?;

        lua.from_value::<Value>(result)
            .map_err(|e| anyhow!("Expression result is not JSON-compatible: {}", e))
    }

    fn state(&self) -> Result<Lua> {
        let lua = Lua::new_with(StdLib::MATH | StdLib::STRING | StdLib::TABLE, LuaOptions::default())
            .map_err(|e| anyhow!("Failed to create Lua state: {}", e))?;
        lua.set_memory_limit(self.memory_limit)
            .map_err(|e| anyhow!("Failed to set Lua memory limit: {}", e))?;

        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals
                .set(*name, mlua::Nil)
                .map_err(|e| anyhow!("Failed to remove '{}' from sandbox: {}", name, e))?;
        }

        // Time helpers replacing os.time / os.date
        let now = lua
            .create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
            .map_err(|e| anyhow!("Failed to create now function: {}", e))?;
        globals
            .set("now", now)
            .map_err(|e| anyhow!("Failed to set now function: {}", e))?;
        let time = lua
            .create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))
            .map_err(|e| anyhow!("Failed to create time function: {}", e))?;
        globals
            .set("time", time)
            .map_err(|e| anyhow!("Failed to set time function: {}", e))?;

        let deadline = Instant::now() + self.timeout;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    Err(mlua::Error::runtime("expression exceeded its time limit"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        )
        .map_err(|e| anyhow!("Failed to install sandbox deadline: {}", e))?;

        Ok(lua)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_against_bound_value() {
        let sandbox = ExpressionSandbox::new();
        assert_eq!(sandbox.eval_value("value * 2", &json!(21)).unwrap(), json!(42));
        assert_eq!(
            sandbox.eval_value("string.upper(value.name)", &json!({ "name": "ann" })).unwrap(),
            json!("ANN")
        );
    }

    #[test]
    fn scripts_return_tables_as_json() {
        let sandbox = ExpressionSandbox::new();
        let inputs = json!({ "score": 4 });
        let out = sandbox
            .run_script("return { doubled = inputs.score * 2, ok = true }", &[("inputs", &inputs)])
            .unwrap();
        assert_eq!(out, json!({ "doubled": 8, "ok": true }));
    }

    #[test]
    fn code_loading_and_os_access_are_unavailable() {
        let sandbox = ExpressionSandbox::new();
        assert!(sandbox.eval_expression("load('return 1')()", &[]).is_err());
        assert!(sandbox.eval_expression("os.time()", &[]).is_err());
        assert!(sandbox.eval_expression("io.write('x')", &[]).is_err());
        assert!(sandbox.eval_expression("setmetatable({}, {})", &[]).is_err());
    }

    #[test]
    fn runaway_loops_hit_the_deadline() {
        let sandbox = ExpressionSandbox::with_limits(16 * 1024 * 1024, Duration::from_millis(50));
        let err = sandbox.run_script("while true do end", &[]).unwrap_err();
        assert!(err.to_string().contains("time limit"), "{err}");
    }

    #[test]
    fn memory_is_capped() {
        let sandbox = ExpressionSandbox::with_limits(1024 * 1024, Duration::from_secs(2));
        assert!(sandbox.eval_expression("string.rep('x', 64 * 1024 * 1024)", &[]).is_err());
    }
}
