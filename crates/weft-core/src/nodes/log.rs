//! The log action executor.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::EngineError;

use super::{ExecInput, NodeExecutor};

/// Executes `action:log` nodes.
///
/// Config: `{message, level?}`. The message arrives already interpolated;
/// it is emitted through the structured log with the execution coordinates
/// and captured in the node output so downstream nodes (and tests) can read
/// it back.
pub struct LogExecutor;

#[async_trait]
impl NodeExecutor for LogExecutor {
    fn kind(&self) -> &'static str {
        "action:log"
    }

    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError> {
        let message = input
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let level = input
            .config
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info");

        match level {
            "debug" => tracing::debug!(
                execution_id = %input.execution_id,
                node_id = %input.node_id,
                attempt = input.attempt,
                "{message}"
            ),
            "warn" => tracing::warn!(
                execution_id = %input.execution_id,
                node_id = %input.node_id,
                attempt = input.attempt,
                "{message}"
            ),
            "error" => tracing::error!(
                execution_id = %input.execution_id,
                node_id = %input.node_id,
                attempt = input.attempt,
                "{message}"
            ),
            _ => tracing::info!(
                execution_id = %input.execution_id,
                node_id = %input.node_id,
                attempt = input.attempt,
                "{message}"
            ),
        }

        Ok(json!({ "message": message, "level": level }))
    }
}
