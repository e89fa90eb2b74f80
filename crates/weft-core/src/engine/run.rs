//! Graph traversal for one claimed execution.
//!
//! A [`Runner`] advances a frontier of ready nodes through the top-level
//! scope, dispatching control-flow operators that recursively traverse
//! their nested scopes (loop bodies, try/catch branches, parallel branch
//! chains). Node outputs accumulate in a shared map that doubles as the
//! evaluation context for every later node.
//!
//! Resume is replay: outputs of nodes completed in a prior run are seeded
//! into the map and those nodes are skipped instead of re-executed. A
//! traversal ends in one of four ways — a final output, a suspension
//! (human task or long delay), cancellation, or a node failure that
//! escaped every retry and try/catch boundary.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use weft_db::models::{BreakerState, Execution, ExecutionStatus, NodeExecution, TaskStatus};
use weft_db::queries::circuit_breakers as breaker_db;
use weft_db::queries::executions as execution_db;
use weft_db::queries::node_executions as node_db;

use crate::error::EngineError;
use crate::expression::{self, EvalContext};
use crate::graph::{
    self, EDGE_FALSE, EDGE_TRUE, NodeDef, NodeKind, Scope, ScopeIndex, WorkflowDefinition,
};
use crate::nodes::ExecInput;

use super::Engine;

/// Scoped variable bindings (`loop`, `catch`, loop item variables).
type Bindings = HashMap<String, Value>;

/// Why a traversal stopped before producing a final output.
#[derive(Debug)]
pub enum Interrupt {
    /// Park the execution; a task completion or timer wake re-enqueues it.
    Suspend {
        node_id: String,
        wake_at: Option<DateTime<Utc>>,
    },
    /// The execution was cancelled while running.
    Cancelled,
    /// A node failure escaped every recovery boundary.
    Failed(Failure),
}

/// A node failure in flight.
#[derive(Debug)]
pub struct Failure {
    pub node_id: String,
    pub error: EngineError,
}

impl Interrupt {
    pub(crate) fn failed(node_id: &str, error: EngineError) -> Self {
        Self::Failed(Failure {
            node_id: node_id.to_owned(),
            error,
        })
    }

    pub(crate) fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Failed(Failure {
            node_id: String::new(),
            error: EngineError::Internal(format!("{context}: {err}")),
        })
    }

    /// Severity used when concurrent nodes finish with different interrupts:
    /// cancellation dominates, then failure, then suspension.
    fn rank(&self) -> u8 {
        match self {
            Self::Cancelled => 3,
            Self::Failed(_) => 2,
            Self::Suspend { .. } => 1,
        }
    }
}

/// Readiness of a node with respect to its inbound edges.
enum Readiness {
    /// Some inbound edge has not terminated yet.
    Wait,
    /// All inbound edges terminated, at least one completed.
    Ready,
    /// Every inbound edge was skipped; the node is skipped too.
    AllSkipped,
    /// A join whose every inbound edge was skipped fails.
    JoinFailed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LocalOutcome {
    Completed,
    Skipped,
}

pub(crate) struct Runner<'a> {
    engine: &'a Engine,
    execution: &'a Execution,
    def: WorkflowDefinition,
    scopes: ScopeIndex,
    /// Latest output per node, shared across scopes; doubles as the `nodes`
    /// section of every evaluation context.
    outputs: Mutex<HashMap<String, Value>>,
    /// Nodes completed in a previous run of this execution (replay skip set).
    replayed: HashSet<String>,
    /// Condition node -> selected edge label.
    chosen: Mutex<HashMap<String, String>>,
    /// Per-node attempt counters; loop iterations and retries both advance
    /// them, keeping `(execution_id, node_id, attempt)` unique.
    attempts: Mutex<HashMap<String, i32>>,
    /// The trigger node that fires for this execution's trigger type.
    active_trigger: Option<String>,
    cancel: CancellationToken,
    sem: Semaphore,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        execution: &'a Execution,
        def: WorkflowDefinition,
        completed: HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> Self {
        let scopes = ScopeIndex::build(&def);
        let replayed = completed.keys().cloned().collect();

        // The trigger matching the execution's trigger type fires; other
        // trigger nodes are skipped. With no kind match, the first trigger
        // fires (sub-workflows and timers enter through it).
        let triggers = def.trigger_nodes();
        let active_trigger = triggers
            .iter()
            .find(|n| {
                NodeKind::parse(&n.kind)
                    .map(|k| k.matches_trigger(execution.trigger_type))
                    .unwrap_or(false)
            })
            .or(triggers.first())
            .map(|n| n.id.clone());

        let parallelism = engine.config().node_parallelism.max(1);

        Self {
            engine,
            execution,
            def,
            scopes,
            outputs: Mutex::new(completed),
            replayed,
            chosen: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            active_trigger,
            cancel,
            sem: Semaphore::new(parallelism),
        }
    }

    pub(crate) async fn run(&self) -> Result<Value, Interrupt> {
        let report = self.def.validate();
        if !report.is_valid() {
            return Err(Interrupt::failed(
                "",
                EngineError::Validation(format!(
                    "definition failed validation: {}",
                    report.errors.join("; ")
                )),
            ));
        }

        let binds = Bindings::new();
        self.run_scope(&self.scopes.top, &binds, true).await
    }

    // -----------------------------------------------------------------
    // Frontier traversal
    // -----------------------------------------------------------------

    fn run_scope<'s>(
        &'s self,
        scope: &'s Scope,
        binds: &'s Bindings,
        replay: bool,
    ) -> BoxFuture<'s, Result<Value, Interrupt>> {
        Box::pin(async move {
            let mut outcomes: HashMap<String, LocalOutcome> = HashMap::new();
            let mut queue: VecDeque<String> = scope
                .entries
                .iter()
                .filter(|e| scope.members.contains(*e))
                .cloned()
                .collect();
            let mut last_output = Value::Null;

            loop {
                // Drain the queue into a batch of ready nodes, propagating
                // skips as they surface.
                let mut batch: Vec<String> = Vec::new();
                while let Some(id) = queue.pop_front() {
                    if outcomes.contains_key(&id) || batch.contains(&id) {
                        continue;
                    }

                    if self.is_inactive_trigger(&id) {
                        self.record_skipped(&id).await;
                        outcomes.insert(id.clone(), LocalOutcome::Skipped);
                        for target in self.successors(scope, &id) {
                            queue.push_back(target);
                        }
                        continue;
                    }

                    match self.readiness(scope, &outcomes, &id) {
                        // Re-enqueued when the remaining inbound edges land.
                        Readiness::Wait => {}
                        Readiness::Ready => batch.push(id),
                        Readiness::AllSkipped => {
                            self.record_skipped(&id).await;
                            outcomes.insert(id.clone(), LocalOutcome::Skipped);
                            for target in self.successors(scope, &id) {
                                queue.push_back(target);
                            }
                        }
                        Readiness::JoinFailed => {
                            return Err(Interrupt::failed(
                                &id,
                                EngineError::JoinUnsatisfied(id.clone()),
                            ));
                        }
                    }
                }

                if batch.is_empty() {
                    break;
                }

                // Independent ready nodes run concurrently; ordering between
                // them is unspecified.
                let results = futures::future::join_all(
                    batch.iter().map(|id| self.dispatch_node(id, binds, replay)),
                )
                .await;

                let mut interrupt: Option<Interrupt> = None;
                for (id, result) in batch.iter().zip(results) {
                    match result {
                        Ok(value) => {
                            last_output = value;
                            outcomes.insert(id.clone(), LocalOutcome::Completed);
                            for target in self.successors(scope, id) {
                                queue.push_back(target);
                            }
                        }
                        Err(incoming) => {
                            interrupt = Some(match interrupt.take() {
                                Some(current) if current.rank() >= incoming.rank() => current,
                                _ => incoming,
                            });
                        }
                    }
                }
                if let Some(interrupt) = interrupt {
                    return Err(interrupt);
                }
            }

            Ok(last_output)
        })
    }

    fn is_inactive_trigger(&self, id: &str) -> bool {
        self.def
            .kind_of(id)
            .map(NodeKind::is_trigger)
            .unwrap_or(false)
            && self.active_trigger.as_deref() != Some(id)
    }

    async fn record_skipped(&self, id: &str) {
        if let Err(e) = node_db::insert_skipped(self.engine.pool(), self.execution.id, id).await {
            tracing::warn!(node_id = %id, error = %e, "failed to record skipped node");
        }
    }

    /// Inbound-edge bookkeeping for one node within a scope.
    fn readiness(
        &self,
        scope: &Scope,
        outcomes: &HashMap<String, LocalOutcome>,
        id: &str,
    ) -> Readiness {
        let mut total = 0usize;
        let mut completed = 0usize;

        for edge in self.def.edges_to(id) {
            // Operator-internal entry edges do not gate the target; the
            // operator traverses its subgraph itself.
            if matches!(edge.label.as_deref(), Some("body" | "try" | "catch")) {
                continue;
            }
            let Some(source) = self.scopes.effective_source(scope, &edge.source) else {
                continue;
            };

            total += 1;
            match outcomes.get(source) {
                None => return Readiness::Wait,
                Some(LocalOutcome::Skipped) => {}
                Some(LocalOutcome::Completed) => {
                    // A condition completes but only its selected branch
                    // counts as a completed inbound for the target.
                    if self.def.kind_of(source) == Some(NodeKind::Condition) {
                        if let Some(label) = edge.label.as_deref() {
                            let selected = self.chosen.lock().unwrap().get(source).cloned();
                            if selected.as_deref() != Some(label) {
                                continue;
                            }
                        }
                    }
                    completed += 1;
                }
            }
        }

        if total == 0 {
            return Readiness::Ready;
        }
        if completed == 0 {
            if self.def.kind_of(id) == Some(NodeKind::Join) {
                return Readiness::JoinFailed;
            }
            return Readiness::AllSkipped;
        }
        Readiness::Ready
    }

    /// Control-flow successors of a node, restricted to the scope.
    fn successors(&self, scope: &Scope, id: &str) -> Vec<String> {
        graph::expansion_targets(&self.def, id)
            .into_iter()
            .filter(|t| scope.members.contains(t))
            .collect()
    }

    // -----------------------------------------------------------------
    // Node dispatch
    // -----------------------------------------------------------------

    fn dispatch_node<'s>(
        &'s self,
        id: &'s str,
        binds: &'s Bindings,
        replay: bool,
    ) -> BoxFuture<'s, Result<Value, Interrupt>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            // Replay: nodes completed in a prior run of this execution are
            // not re-executed.
            if replay && self.replayed.contains(id) {
                let value = self
                    .outputs
                    .lock()
                    .unwrap()
                    .get(id)
                    .cloned()
                    .unwrap_or(Value::Null);
                if self.def.kind_of(id) == Some(NodeKind::Condition) {
                    let label = if value.get("result").and_then(Value::as_bool).unwrap_or(false) {
                        EDGE_TRUE
                    } else {
                        EDGE_FALSE
                    };
                    self.chosen
                        .lock()
                        .unwrap()
                        .insert(id.to_owned(), label.to_owned());
                }
                return Ok(value);
            }

            let node = self
                .def
                .node(id)
                .cloned()
                .ok_or_else(|| {
                    Interrupt::failed(
                        id,
                        EngineError::Internal(format!("node {id} missing from definition")),
                    )
                })?;
            let kind = NodeKind::parse(&node.kind).ok_or_else(|| {
                Interrupt::failed(
                    id,
                    EngineError::Internal(format!("unknown node kind {:?}", node.kind)),
                )
            })?;

            tracing::debug!(
                execution_id = %self.execution.id,
                node_id = %id,
                kind = %node.kind,
                "dispatching node"
            );

            let value = match kind {
                k if k.is_trigger() => self.run_trigger(&node).await?,
                NodeKind::Condition => self.run_condition(&node, binds).await?,
                NodeKind::Fork => self.run_fork(&node).await?,
                NodeKind::Join => self.run_join(&node).await?,
                NodeKind::Loop => self.run_loop(&node, binds).await?,
                NodeKind::Parallel => self.run_parallel(&node, binds, replay).await?,
                NodeKind::TryCatch => self.run_trycatch(&node, binds, replay).await?,
                NodeKind::Retry => self.run_retry(&node, binds, replay).await?,
                NodeKind::CircuitBreaker => self.run_breaker(&node, binds, replay).await?,
                NodeKind::Delay => self.run_delay(&node, binds).await?,
                NodeKind::SubWorkflow => self.run_subworkflow(&node, binds).await?,
                NodeKind::HumanTask => self.run_humantask(&node, binds).await?,
                _ => self.run_leaf(&node, kind, binds).await?,
            };

            self.outputs
                .lock()
                .unwrap()
                .insert(id.to_owned(), value.clone());
            Ok(value)
        })
    }

    fn next_attempt(&self, id: &str) -> i32 {
        let mut attempts = self.attempts.lock().unwrap();
        let counter = attempts.entry(id.to_owned()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn eval_context(&self, binds: &Bindings) -> EvalContext {
        EvalContext {
            trigger: self.execution.trigger_payload.clone(),
            env: json!({
                "execution_id": self.execution.id,
                "workflow_id": self.execution.workflow_id,
                "tenant_id": self.execution.tenant_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            nodes: self.outputs.lock().unwrap().clone(),
            scoped: binds.clone(),
        }
    }

    async fn start_row(
        &self,
        node_id: &str,
        attempt: i32,
        input: &Value,
    ) -> Result<NodeExecution, Interrupt> {
        node_db::upsert_started(self.engine.pool(), self.execution.id, node_id, attempt, input)
            .await
            .map_err(|e| Interrupt::internal("record node start", e))
    }

    async fn complete_row(&self, row: &NodeExecution, output: &Value) -> Result<(), Interrupt> {
        node_db::mark_completed(self.engine.pool(), row.id, output)
            .await
            .map_err(|e| Interrupt::internal("record node completion", e))?;
        Ok(())
    }

    async fn fail_row(&self, row: &NodeExecution, error: &str) {
        if let Err(e) = node_db::mark_failed(self.engine.pool(), row.id, error).await {
            tracing::warn!(node_id = %row.node_id, error = %e, "failed to record node failure");
        }
    }

    /// Record the row outcome for an interrupt bubbling through an
    /// operator. Suspensions leave the row running; the replay resets it.
    async fn fail_row_on_interrupt(&self, row: &NodeExecution, interrupt: &Interrupt) {
        match interrupt {
            Interrupt::Failed(failure) => {
                self.fail_row(row, &failure.error.to_string()).await;
            }
            Interrupt::Cancelled => self.fail_row(row, "cancelled").await,
            Interrupt::Suspend { .. } => {}
        }
    }

    // -----------------------------------------------------------------
    // Plain nodes
    // -----------------------------------------------------------------

    async fn run_trigger(&self, node: &NodeDef) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let payload = self.execution.trigger_payload.clone();
        let row = self.start_row(&node.id, attempt, &payload).await?;
        self.complete_row(&row, &payload).await?;
        Ok(payload)
    }

    async fn run_condition(&self, node: &NodeDef, binds: &Bindings) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        let Some(expr) = node.config.get("expression").and_then(Value::as_str) else {
            let row = self.start_row(&node.id, attempt, &node.config).await?;
            let error = EngineError::Validation(format!(
                "condition node {:?} requires config.expression",
                node.id
            ));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        let row = self
            .start_row(&node.id, attempt, &json!({ "expression": expr }))
            .await?;

        match expression::evaluate_bool(expr, &eval) {
            Ok(result) => {
                let label = if result { EDGE_TRUE } else { EDGE_FALSE };
                self.chosen
                    .lock()
                    .unwrap()
                    .insert(node.id.clone(), label.to_owned());
                let output = json!({ "result": result });
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
            Err(error) => {
                self.fail_row(&row, &error.to_string()).await;
                Err(Interrupt::failed(&node.id, error))
            }
        }
    }

    async fn run_fork(&self, node: &NodeDef) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let output = json!({ "forked": true });
        let row = self.start_row(&node.id, attempt, &Value::Null).await?;
        self.complete_row(&row, &output).await?;
        Ok(output)
    }

    async fn run_join(&self, node: &NodeDef) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);

        // Aggregate the outputs of the completed inbound branches.
        let aggregate = {
            let outputs = self.outputs.lock().unwrap();
            let mut aggregate = serde_json::Map::new();
            for edge in self.def.edges_to(&node.id) {
                if let Some(value) = outputs.get(&edge.source) {
                    aggregate.insert(edge.source.clone(), value.clone());
                }
            }
            aggregate
        };

        let output = Value::Object(aggregate);
        let row = self.start_row(&node.id, attempt, &Value::Null).await?;
        self.complete_row(&row, &output).await?;
        Ok(output)
    }

    async fn run_leaf(
        &self,
        node: &NodeDef,
        kind: NodeKind,
        binds: &Bindings,
    ) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        // Code configs are not rendered: JS template literals share the
        // `${}` syntax with the expression language.
        let rendered = if kind == NodeKind::ActionCode {
            node.config.clone()
        } else {
            match expression::render_value(&node.config, &eval) {
                Ok(rendered) => rendered,
                Err(error) => {
                    let row = self.start_row(&node.id, attempt, &node.config).await?;
                    self.fail_row(&row, &error.to_string()).await;
                    return Err(Interrupt::failed(&node.id, error));
                }
            }
        };

        let row = self.start_row(&node.id, attempt, &rendered).await?;

        let Some(executor) = self.engine.registry().get(&node.kind) else {
            let error =
                EngineError::Internal(format!("no executor registered for kind {:?}", node.kind));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        let default_timeout = match kind {
            NodeKind::ActionCode => self.engine.config().code_timeout,
            _ => self.engine.config().http_timeout,
        };

        let input = ExecInput {
            config: &rendered,
            eval: &eval,
            cancel: &self.cancel,
            execution_id: self.execution.id,
            node_id: &node.id,
            attempt,
            default_timeout,
        };
        let deadline = input.timeout();

        // The semaphore caps concurrent leaf evaluations per execution.
        let _permit = self
            .sem
            .acquire()
            .await
            .map_err(|e| Interrupt::internal("acquire parallelism permit", e))?;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(EngineError::Cancelled("execution cancelled".to_owned()))
            }
            result = tokio::time::timeout(deadline, executor.execute(input)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout(deadline.as_millis() as u64)),
                }
            }
        };

        match outcome {
            Ok(output) => {
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
            Err(EngineError::Cancelled(_)) => {
                self.fail_row(&row, "cancelled").await;
                Err(Interrupt::Cancelled)
            }
            Err(error) => {
                self.fail_row(&row, &error.to_string()).await;
                Err(Interrupt::failed(&node.id, error))
            }
        }
    }

    // -----------------------------------------------------------------
    // Control-flow operators
    // -----------------------------------------------------------------

    async fn run_loop(&self, node: &NodeDef, binds: &Bindings) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        let config = match expression::render_value(&node.config, &eval) {
            Ok(config) => config,
            Err(error) => {
                let row = self.start_row(&node.id, attempt, &node.config).await?;
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };
        let row = self.start_row(&node.id, attempt, &config).await?;

        let source = match config.get("source") {
            Some(Value::String(expr)) => match expression::evaluate(expr, &eval) {
                Ok(value) => value,
                Err(error) => {
                    self.fail_row(&row, &error.to_string()).await;
                    return Err(Interrupt::failed(&node.id, error));
                }
            },
            Some(value) => value.clone(),
            None => {
                let error =
                    EngineError::Validation(format!("loop node {:?} requires config.source", node.id));
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };

        // Arrays iterate positionally; objects by insertion order.
        let items: Vec<(Option<String>, Value)> = match source {
            Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            other => {
                let error = EngineError::Validation(format!(
                    "loop source must be an array or object, got {other}"
                ));
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };

        let max = config
            .get("max_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(1000) as usize;
        if items.len() > max {
            let error = EngineError::IterationLimitExceeded {
                count: items.len(),
                max,
            };
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        }

        let item_var = config
            .get("item_variable")
            .and_then(Value::as_str)
            .unwrap_or("item")
            .to_owned();
        let index_var = config
            .get("index_variable")
            .and_then(Value::as_str)
            .unwrap_or("index")
            .to_owned();
        let key_var = config
            .get("key_variable")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut break_exprs: Vec<String> = Vec::new();
        if let Some(expr) = config.get("break_condition").and_then(Value::as_str) {
            break_exprs.push(expr.to_owned());
        }
        for expr in config
            .get("break_conditions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            break_exprs.push(expr.to_owned());
        }

        let Some(body) = self.scopes.loop_bodies.get(&node.id) else {
            let error =
                EngineError::Internal(format!("loop node {:?} has no body scope", node.id));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        let mut results = Vec::with_capacity(items.len());
        for (index, (key, item)) in items.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.fail_row(&row, "cancelled").await;
                return Err(Interrupt::Cancelled);
            }

            let mut iteration_binds = binds.clone();
            iteration_binds.insert(item_var.clone(), item.clone());
            iteration_binds.insert(index_var.clone(), json!(index));
            if let (Some(var), Some(key)) = (&key_var, &key) {
                iteration_binds.insert(var.clone(), json!(key));
            }
            iteration_binds.insert(
                "loop".to_owned(),
                json!({ "item": item, "index": index, "key": key }),
            );

            // Body nodes re-run every iteration; replay does not apply.
            match self.run_scope(body, &iteration_binds, false).await {
                Ok(output) => results.push(output),
                Err(interrupt) => {
                    self.fail_row_on_interrupt(&row, &interrupt).await;
                    return Err(interrupt);
                }
            }

            let iteration_eval = self.eval_context(&iteration_binds);
            let stop = break_exprs
                .iter()
                .any(|expr| expression::evaluate_bool(expr, &iteration_eval).unwrap_or(false));
            if stop {
                tracing::debug!(
                    execution_id = %self.execution.id,
                    node_id = %node.id,
                    iteration = index,
                    "loop break condition met"
                );
                break;
            }
        }

        let output = Value::Array(results);
        self.complete_row(&row, &output).await?;
        Ok(output)
    }

    async fn run_parallel(
        &self,
        node: &NodeDef,
        binds: &Bindings,
        replay: bool,
    ) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let row = self.start_row(&node.id, attempt, &node.config).await?;

        let branches: Vec<(String, Vec<String>)> = node
            .config
            .get("branches")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(i, branch)| {
                let name = branch
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("branch_{i}"));
                let nodes = branch
                    .get("nodes")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
                (name, nodes)
            })
            .collect();

        if branches.is_empty() {
            let error = EngineError::Validation(format!(
                "parallel node {:?} has no branches",
                node.id
            ));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        }

        let strategy = node
            .config
            .get("error_strategy")
            .and_then(Value::as_str)
            .unwrap_or("fail_fast");
        let cap = node
            .config
            .get("max_concurrency")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(branches.len())
            .clamp(1, branches.len());

        // Each branch is a chain of node ids run sequentially; branches run
        // concurrently under the cap.
        let futures = branches.into_iter().map(|(name, nodes)| async move {
            let mut last = Value::Null;
            for node_id in &nodes {
                match self.dispatch_node(node_id, binds, replay).await {
                    Ok(value) => last = value,
                    Err(interrupt) => return (name, Err(interrupt)),
                }
            }
            (name, Ok(last))
        });
        let mut stream = stream::iter(futures).buffer_unordered(cap);

        let mut aggregate = serde_json::Map::new();
        let mut failures: Vec<(String, Failure)> = Vec::new();

        while let Some((name, result)) = stream.next().await {
            match result {
                Ok(value) => {
                    aggregate.insert(name, value);
                }
                Err(Interrupt::Failed(failure)) => match strategy {
                    "fail_fast" => {
                        // Dropping the stream cancels sibling branches
                        // mid-flight.
                        drop(stream);
                        self.fail_row(&row, &failure.error.to_string()).await;
                        return Err(Interrupt::Failed(failure));
                    }
                    "continue_on_error" => {
                        aggregate.insert(name, json!({ "error": failure.error.to_string() }));
                    }
                    _ => failures.push((name, failure)),
                },
                Err(other) => {
                    drop(stream);
                    self.fail_row_on_interrupt(&row, &other).await;
                    return Err(other);
                }
            }
        }

        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|(name, failure)| format!("{name}: {}", failure.error))
                .collect::<Vec<_>>()
                .join("; ");
            let error = EngineError::Downstream(format!("parallel branches failed: {summary}"));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        }

        let output = Value::Object(aggregate);
        self.complete_row(&row, &output).await?;
        Ok(output)
    }

    async fn run_trycatch(
        &self,
        node: &NodeDef,
        binds: &Bindings,
        replay: bool,
    ) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let row = self.start_row(&node.id, attempt, &Value::Null).await?;

        let Some(try_scope) = self.scopes.try_branches.get(&node.id) else {
            let error =
                EngineError::Internal(format!("trycatch node {:?} has no try scope", node.id));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        match self.run_scope(try_scope, binds, replay).await {
            Ok(output) => {
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
            Err(Interrupt::Failed(failure)) => {
                let Some(catch_scope) = self.scopes.catch_branches.get(&node.id) else {
                    self.fail_row(&row, &failure.error.to_string()).await;
                    return Err(Interrupt::Failed(failure));
                };

                tracing::info!(
                    execution_id = %self.execution.id,
                    node_id = %node.id,
                    failed_node = %failure.node_id,
                    error = %failure.error,
                    "entering catch branch"
                );

                let mut catch_binds = binds.clone();
                catch_binds.insert(
                    "catch".to_owned(),
                    json!({
                        "error": {
                            "message": failure.error.to_string(),
                            "code": failure.error.code(),
                            "node_id": failure.node_id,
                        }
                    }),
                );

                match self.run_scope(catch_scope, &catch_binds, replay).await {
                    Ok(output) => {
                        self.complete_row(&row, &output).await?;
                        Ok(output)
                    }
                    Err(interrupt) => {
                        self.fail_row_on_interrupt(&row, &interrupt).await;
                        Err(interrupt)
                    }
                }
            }
            Err(other) => {
                self.fail_row_on_interrupt(&row, &other).await;
                Err(other)
            }
        }
    }

    async fn run_retry(
        &self,
        node: &NodeDef,
        binds: &Bindings,
        replay: bool,
    ) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let row = self.start_row(&node.id, attempt, &node.config).await?;

        let Some(child) = self.scopes.wrapped_children.get(&node.id) else {
            let error =
                EngineError::Internal(format!("retry node {:?} wraps no child", node.id));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        let max_retries = node
            .config
            .get("max_retries")
            .and_then(Value::as_u64)
            .unwrap_or(3) as u32;
        let initial_backoff = node
            .config
            .get("initial_backoff_ms")
            .and_then(Value::as_u64)
            .unwrap_or(1000);
        let max_backoff = node
            .config
            .get("max_backoff_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);
        let multiplier = node
            .config
            .get("backoff_multiplier")
            .and_then(Value::as_f64)
            .unwrap_or(2.0);
        let retry_on_codes: Option<Vec<String>> =
            node.config.get("retry_on_codes").and_then(|v| {
                v.as_array().map(|codes| {
                    codes
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
            });

        let mut tries = 0u32;
        loop {
            match self.dispatch_node(child, binds, replay).await {
                Ok(output) => {
                    self.complete_row(&row, &output).await?;
                    return Ok(output);
                }
                Err(Interrupt::Failed(failure)) => {
                    let retryable = match &retry_on_codes {
                        Some(codes) => codes.iter().any(|c| c == failure.error.code()),
                        None => failure.error.is_retryable(),
                    };
                    if !retryable || tries >= max_retries {
                        self.fail_row(&row, &failure.error.to_string()).await;
                        return Err(Interrupt::Failed(failure));
                    }

                    let backoff = (initial_backoff as f64 * multiplier.powi(tries as i32))
                        .min(max_backoff as f64) as u64;
                    tries += 1;
                    tracing::info!(
                        execution_id = %self.execution.id,
                        node_id = %node.id,
                        child = %child,
                        attempt = tries,
                        backoff_ms = backoff,
                        error = %failure.error,
                        "retrying child after backoff"
                    );

                    // Cancellation wakes the backoff immediately.
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.fail_row(&row, "cancelled").await;
                            return Err(Interrupt::Cancelled);
                        }
                        _ = tokio::time::sleep(std::time::Duration::from_millis(backoff)) => {}
                    }
                }
                Err(other) => {
                    self.fail_row_on_interrupt(&row, &other).await;
                    return Err(other);
                }
            }
        }
    }

    async fn run_breaker(
        &self,
        node: &NodeDef,
        binds: &Bindings,
        replay: bool,
    ) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let row = self.start_row(&node.id, attempt, &node.config).await?;

        let Some(child) = self.scopes.wrapped_children.get(&node.id) else {
            let error =
                EngineError::Internal(format!("circuit breaker {:?} wraps no child", node.id));
            self.fail_row(&row, &error.to_string()).await;
            return Err(Interrupt::failed(&node.id, error));
        };

        let failure_threshold = node
            .config
            .get("failure_threshold")
            .and_then(Value::as_u64)
            .unwrap_or(5) as i32;
        let reset_timeout_ms = node
            .config
            .get("reset_timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(60_000) as i64;
        let half_open_requests = node
            .config
            .get("half_open_requests")
            .and_then(Value::as_u64)
            .unwrap_or(1) as i32;

        // Admission: loop over compare-and-set until we win a slot or the
        // breaker refuses.
        let pool = self.engine.pool();
        let mut admitted_half_open = false;
        for _ in 0..8 {
            let breaker = breaker_db::get_or_create(
                pool,
                self.execution.tenant_id,
                self.execution.workflow_id,
                &node.id,
            )
            .await
            .map_err(|e| Interrupt::internal("load circuit breaker", e))?;

            match breaker.state {
                BreakerState::Closed => {
                    admitted_half_open = false;
                    break;
                }
                BreakerState::Open => {
                    let reset_due = breaker
                        .opened_at
                        .map(|t| Utc::now() - t >= ChronoDuration::milliseconds(reset_timeout_ms))
                        .unwrap_or(true);
                    if !reset_due {
                        let error = EngineError::CircuitOpen(node.id.clone());
                        self.fail_row(&row, &error.to_string()).await;
                        return Err(Interrupt::failed(&node.id, error));
                    }
                    // Reset window elapsed: try to move to half-open.
                    let _ = breaker_db::cas_update(
                        pool,
                        self.execution.workflow_id,
                        &node.id,
                        breaker.version,
                        BreakerState::HalfOpen,
                        breaker.failure_count,
                        0,
                        breaker.opened_at,
                    )
                    .await
                    .map_err(|e| Interrupt::internal("update circuit breaker", e))?;
                    // Re-read; another worker may have won.
                }
                BreakerState::HalfOpen => {
                    if breaker.half_open_attempts >= half_open_requests {
                        let error = EngineError::CircuitOpen(node.id.clone());
                        self.fail_row(&row, &error.to_string()).await;
                        return Err(Interrupt::failed(&node.id, error));
                    }
                    let rows = breaker_db::cas_update(
                        pool,
                        self.execution.workflow_id,
                        &node.id,
                        breaker.version,
                        BreakerState::HalfOpen,
                        breaker.failure_count,
                        breaker.half_open_attempts + 1,
                        breaker.opened_at,
                    )
                    .await
                    .map_err(|e| Interrupt::internal("update circuit breaker", e))?;
                    if rows == 1 {
                        admitted_half_open = true;
                        break;
                    }
                    // Lost the race; re-read.
                }
            }
        }

        let result = self.dispatch_node(child, binds, replay).await;

        match result {
            Ok(output) => {
                self.record_breaker_success(&node.id).await;
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
            Err(Interrupt::Failed(failure)) => {
                self.record_breaker_failure(&node.id, failure_threshold, admitted_half_open)
                    .await;
                self.fail_row(&row, &failure.error.to_string()).await;
                Err(Interrupt::Failed(failure))
            }
            Err(other) => {
                self.fail_row_on_interrupt(&row, &other).await;
                Err(other)
            }
        }
    }

    /// Any success closes the breaker and resets its counters.
    async fn record_breaker_success(&self, node_id: &str) {
        let pool = self.engine.pool();
        for _ in 0..4 {
            let Ok(breaker) = breaker_db::get_or_create(
                pool,
                self.execution.tenant_id,
                self.execution.workflow_id,
                node_id,
            )
            .await
            else {
                return;
            };

            if breaker.state == BreakerState::Closed && breaker.failure_count == 0 {
                return;
            }
            match breaker_db::cas_update(
                pool,
                self.execution.workflow_id,
                node_id,
                breaker.version,
                BreakerState::Closed,
                0,
                0,
                None,
            )
            .await
            {
                Ok(1) => return,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "breaker success update failed");
                    return;
                }
            }
        }
    }

    /// A failure counts toward the threshold in `closed`, and re-opens the
    /// breaker immediately in `half_open`.
    async fn record_breaker_failure(
        &self,
        node_id: &str,
        failure_threshold: i32,
        half_open_trial: bool,
    ) {
        let pool = self.engine.pool();
        for _ in 0..4 {
            let Ok(breaker) = breaker_db::get_or_create(
                pool,
                self.execution.tenant_id,
                self.execution.workflow_id,
                node_id,
            )
            .await
            else {
                return;
            };

            let (state, failures, opened_at) = match breaker.state {
                BreakerState::Closed => {
                    let failures = breaker.failure_count + 1;
                    if failures >= failure_threshold {
                        (BreakerState::Open, failures, Some(Utc::now()))
                    } else {
                        (BreakerState::Closed, failures, None)
                    }
                }
                BreakerState::HalfOpen if half_open_trial => {
                    (BreakerState::Open, breaker.failure_count, Some(Utc::now()))
                }
                _ => return,
            };

            match breaker_db::cas_update(
                pool,
                self.execution.workflow_id,
                node_id,
                breaker.version,
                state,
                failures,
                0,
                opened_at,
            )
            .await
            {
                Ok(1) => {
                    if state == BreakerState::Open {
                        tracing::warn!(
                            workflow_id = %self.execution.workflow_id,
                            node_id = %node_id,
                            failures,
                            "circuit breaker opened"
                        );
                    }
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "breaker failure update failed");
                    return;
                }
            }
        }
    }

    async fn run_delay(&self, node: &NodeDef, binds: &Bindings) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        let config = match expression::render_value(&node.config, &eval) {
            Ok(config) => config,
            Err(error) => {
                let row = self.start_row(&node.id, attempt, &node.config).await?;
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };
        let row = self.start_row(&node.id, attempt, &config).await?;

        let duration_ms = match config.get("duration_ms").and_then(Value::as_u64) {
            Some(ms) => ms,
            None => {
                let expr = config
                    .get("duration_expression")
                    .and_then(Value::as_str)
                    .unwrap_or("0");
                match expression::evaluate(expr, &eval) {
                    Ok(value) => value.as_u64().unwrap_or(0),
                    Err(error) => {
                        self.fail_row(&row, &error.to_string()).await;
                        return Err(Interrupt::failed(&node.id, error));
                    }
                }
            }
        };

        let output = json!({ "delayed_ms": duration_ms });

        if duration_ms >= self.engine.config().delay_suspend_threshold_ms {
            // Long delay: persist the node as completed, then park the
            // execution with a wake-up time. The timer scanner re-enqueues
            // it and the replay skips straight past this node.
            let wake_at = Utc::now() + ChronoDuration::milliseconds(duration_ms as i64);
            self.complete_row(&row, &output).await?;
            return Err(Interrupt::Suspend {
                node_id: node.id.clone(),
                wake_at: Some(wake_at),
            });
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.fail_row(&row, "cancelled").await;
                Err(Interrupt::Cancelled)
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(duration_ms)) => {
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
        }
    }

    async fn run_subworkflow(&self, node: &NodeDef, binds: &Bindings) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        let config = match expression::render_value(&node.config, &eval) {
            Ok(config) => config,
            Err(error) => {
                let row = self.start_row(&node.id, attempt, &node.config).await?;
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };
        let row = self.start_row(&node.id, attempt, &config).await?;
        let pool = self.engine.pool();

        // A child may already exist from a previous pass (suspension inside
        // the child, or crash replay).
        let mut child = execution_db::find_child(pool, self.execution.id, &node.id)
            .await
            .map_err(|e| Interrupt::internal("find child execution", e))?;

        if child.is_none() {
            let workflow_id = config
                .get("workflow_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());
            let Some(workflow_id) = workflow_id else {
                let error = EngineError::Validation(format!(
                    "subworkflow node {:?} requires a workflow_id",
                    node.id
                ));
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            };
            let version = config
                .get("version")
                .and_then(Value::as_i64)
                .map(|v| v as i32);
            let input = config.get("input").cloned().unwrap_or(Value::Null);

            let started = self
                .engine
                .start(
                    self.execution.tenant_id,
                    workflow_id,
                    version,
                    weft_db::models::TriggerType::Subworkflow,
                    input,
                    Some((self.execution, node.id.as_str())),
                )
                .await;

            child = match started {
                Ok(execution) => Some(execution),
                Err(error) => {
                    self.fail_row(&row, &error.to_string()).await;
                    return Err(Interrupt::failed(&node.id, error));
                }
            };
        }

        let child = child.expect("child execution present");

        // Drive the child inline when it is claimable; otherwise (another
        // worker owns it, or it is itself suspended) park the parent — the
        // child's terminal transition resumes us.
        if !child.status.is_terminal() {
            if child.status == ExecutionStatus::Pending {
                let worker_tag = format!("inline-{}", self.execution.id.simple());
                let claimed = execution_db::claim_execution(pool, child.id, &worker_tag)
                    .await
                    .map_err(|e| Interrupt::internal("claim child execution", e))?;
                if let Some(claimed) = claimed {
                    self.engine.drive_execution(claimed).await;
                }
            }

            let refreshed = execution_db::get_execution_any(pool, child.id)
                .await
                .map_err(|e| Interrupt::internal("reload child execution", e))?;
            match refreshed {
                Some(refreshed) if refreshed.status.is_terminal() => {
                    return self.bind_child_result(node, &row, &refreshed).await;
                }
                _ => {
                    return Err(Interrupt::Suspend {
                        node_id: node.id.clone(),
                        wake_at: None,
                    });
                }
            }
        }

        self.bind_child_result(node, &row, &child).await
    }

    async fn bind_child_result(
        &self,
        node: &NodeDef,
        row: &NodeExecution,
        child: &Execution,
    ) -> Result<Value, Interrupt> {
        match child.status {
            ExecutionStatus::Completed => {
                let output = json!({
                    "execution_id": child.id,
                    "output": child.output.clone().unwrap_or(Value::Null),
                });
                self.complete_row(row, &output).await?;
                Ok(output)
            }
            ExecutionStatus::Failed => {
                let error = EngineError::Downstream(format!(
                    "sub-workflow execution {} failed: {}",
                    child.id,
                    child.error_message.as_deref().unwrap_or("unknown error")
                ));
                self.fail_row(row, &error.to_string()).await;
                Err(Interrupt::failed(&node.id, error))
            }
            _ => {
                let error = EngineError::Cancelled(format!(
                    "sub-workflow execution {} was cancelled",
                    child.id
                ));
                self.fail_row(row, &error.to_string()).await;
                Err(Interrupt::failed(&node.id, error))
            }
        }
    }

    async fn run_humantask(&self, node: &NodeDef, binds: &Bindings) -> Result<Value, Interrupt> {
        let attempt = self.next_attempt(&node.id);
        let eval = self.eval_context(binds);

        let config = match expression::render_value(&node.config, &eval) {
            Ok(config) => config,
            Err(error) => {
                let row = self.start_row(&node.id, attempt, &node.config).await?;
                self.fail_row(&row, &error.to_string()).await;
                return Err(Interrupt::failed(&node.id, error));
            }
        };
        let row = self.start_row(&node.id, attempt, &config).await?;

        let (task, created) = self
            .engine
            .tasks()
            .create_for_node(self.execution, &node.id, &config)
            .await
            .map_err(|error| Interrupt::failed(&node.id, error))?;

        match task.status {
            TaskStatus::Pending => {
                if created {
                    tracing::info!(
                        execution_id = %self.execution.id,
                        node_id = %node.id,
                        task_id = %task.id,
                        "suspending on human task"
                    );
                }
                Err(Interrupt::Suspend {
                    node_id: node.id.clone(),
                    wake_at: None,
                })
            }
            TaskStatus::Cancelled => {
                let error =
                    EngineError::Cancelled(format!("human task {} was cancelled", task.id));
                self.fail_row(&row, &error.to_string()).await;
                Err(Interrupt::failed(&node.id, error))
            }
            status => {
                let output = json!({
                    "task_id": task.id,
                    "status": status.to_string(),
                    "response": task.response_data.clone().unwrap_or(Value::Null),
                    "completed_by": task.completed_by,
                });
                self.complete_row(&row, &output).await?;
                Ok(output)
            }
        }
    }
}
