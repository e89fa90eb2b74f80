//! Transform and formula executors: pure data shaping.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

use super::{ExecInput, NodeExecutor};

/// Executes `action:transform` nodes.
///
/// Config: `{mappings: {out_field: value-or-expression, ...}}`. The engine
/// renders the config before execution, so by the time this runs every
/// expression has been resolved; the output is simply the rendered mapping.
pub struct TransformExecutor;

#[async_trait]
impl NodeExecutor for TransformExecutor {
    fn kind(&self) -> &'static str {
        "action:transform"
    }

    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError> {
        let mappings = input
            .config
            .get("mappings")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        if !mappings.is_object() {
            return Err(EngineError::Validation(
                "transform node requires config.mappings to be an object".to_owned(),
            ));
        }
        Ok(mappings)
    }
}

/// Executes `action:formula` nodes.
///
/// Config: `{expression, default?}`. Evaluates one expression against the
/// context; a null result falls back to `default` when configured.
pub struct FormulaExecutor;

#[async_trait]
impl NodeExecutor for FormulaExecutor {
    fn kind(&self) -> &'static str {
        "action:formula"
    }

    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError> {
        let expression = input
            .config
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Validation("formula node requires an expression".to_owned())
            })?;

        let mut result = crate::expression::evaluate(expression, input.eval)?;
        if result.is_null() {
            if let Some(default) = input.config.get("default") {
                result = default.clone();
            }
        }
        Ok(result)
    }
}
