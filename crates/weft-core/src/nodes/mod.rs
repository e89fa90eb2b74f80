//! Leaf node executors and their registry.
//!
//! Each executor implements the node contract for one `action:*` kind:
//! consume the rendered config plus the evaluation context, produce an
//! output value or an [`EngineError`]. Executors perform the side effects;
//! timeouts and cancellation are enforced by the engine around
//! [`NodeExecutor::execute`].

mod code;
mod http;
mod log;
mod transform;

pub use code::CodeExecutor;
pub use http::HttpExecutor;
pub use log::LogExecutor;
pub use transform::{FormulaExecutor, TransformExecutor};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression::EvalContext;

/// Everything an executor sees about the node it is running.
pub struct ExecInput<'a> {
    /// Node config with every `${...}` expression already resolved.
    pub config: &'a Value,
    /// The evaluation context the config was resolved against.
    pub eval: &'a EvalContext,
    /// Execution-scoped cancellation token.
    pub cancel: &'a CancellationToken,
    pub execution_id: Uuid,
    pub node_id: &'a str,
    pub attempt: i32,
    /// Default timeout for this node kind; config may override.
    pub default_timeout: Duration,
}

impl ExecInput<'_> {
    /// Effective timeout: `config.timeout_seconds` when present, else the
    /// kind default.
    pub fn timeout(&self) -> Duration {
        self.config
            .get("timeout_seconds")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_timeout)
    }
}

/// The node contract. Object-safe so executors can live in the registry as
/// `Arc<dyn NodeExecutor>`.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The `namespace:name` kind string this executor handles.
    fn kind(&self) -> &'static str;

    /// Run the node.
    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError>;
}

/// A collection of registered executors, keyed by node kind.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in executor registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(HttpExecutor::new());
        registry.register(TransformExecutor);
        registry.register(FormulaExecutor);
        registry.register(CodeExecutor);
        registry.register(LogExecutor);
        registry
    }

    /// Register an executor under the kind it reports. An executor already
    /// registered for that kind is replaced and returned.
    pub fn register(
        &mut self,
        executor: impl NodeExecutor + 'static,
    ) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.insert(executor.kind(), Arc::new(executor))
    }

    /// Look up an executor by node kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(kind).cloned()
    }

    /// List the registered kinds.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.executors.keys().copied().collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
