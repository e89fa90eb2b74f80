//! The sandboxed code executor (QuickJS).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

use super::{ExecInput, NodeExecutor};

/// Executes `action:code` nodes in an embedded QuickJS runtime.
///
/// Config: `{script, timeout_seconds?}`. The engine passes the config
/// unrendered for this kind (JS template literals share the `${}` syntax).
/// The script runs as the body of `function(input)` where `input` is the
/// evaluation context (`trigger`, `env`, node outputs); its return value,
/// serialized through JSON, becomes the node output.
///
/// The sandbox has no host bindings: no filesystem, no network, no clock
/// beyond what QuickJS provides. A deadline-checking interrupt handler
/// stops runaway scripts.
pub struct CodeExecutor;

#[async_trait]
impl NodeExecutor for CodeExecutor {
    fn kind(&self) -> &'static str {
        "action:code"
    }

    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError> {
        let script = input
            .config
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("code node requires a script".to_owned()))?
            .to_owned();

        let context = serde_json::json!({
            "trigger": input.eval.trigger,
            "env": input.eval.env,
            "nodes": input.eval.nodes,
        });
        let context_json =
            serde_json::to_string(&context).map_err(EngineError::internal)?;
        let timeout = input.timeout();

        // QuickJS evaluation is synchronous; run it off the async runtime.
        tokio::task::spawn_blocking(move || run_script(&script, &context_json, timeout))
            .await
            .map_err(EngineError::internal)?
    }
}

fn run_script(script: &str, context_json: &str, timeout: Duration) -> Result<Value, EngineError> {
    let runtime = rquickjs::Runtime::new().map_err(EngineError::internal)?;

    let deadline = Instant::now() + timeout;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = rquickjs::Context::full(&runtime).map_err(EngineError::internal)?;

    // The context crosses into JS through JSON.parse of an escaped literal,
    // and the result comes back through JSON.stringify. `?? null` keeps a
    // script with no return value from producing undefined, which does not
    // survive stringification.
    let escaped = serde_json::to_string(context_json).map_err(EngineError::internal)?;
    let source = format!(
        "JSON.stringify((function(input) {{\n{script}\n}})(JSON.parse({escaped})) ?? null)"
    );

    let result: Result<String, rquickjs::Error> = context.with(|ctx| ctx.eval(source));

    match result {
        Ok(serialized) => {
            serde_json::from_str(&serialized).map_err(EngineError::internal)
        }
        Err(e) => {
            if Instant::now() >= deadline {
                Err(EngineError::Timeout(timeout.as_millis() as u64))
            } else {
                Err(EngineError::Expression(format!("script failed: {e}")))
            }
        }
    }
}
