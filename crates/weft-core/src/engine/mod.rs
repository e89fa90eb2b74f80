//! The execution engine: public operations, the worker claim loop, and the
//! maintenance loops (timer wake-ups, stale-claim recovery).
//!
//! The executions table is the durable queue. `start` enqueues a `pending`
//! row; workers claim rows one at a time and drive the graph traversal in
//! [`run::Runner`]. Suspension releases the claim; resumption re-enqueues
//! the row and the next claim replays completed node outputs from the
//! store.

mod run;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_db::models::{Execution, ExecutionStatus, NodeExecution, TriggerType, WorkflowStatus};
use weft_db::queries::executions as execution_db;
use weft_db::queries::executions::NewExecution;
use weft_db::queries::node_executions as node_db;
use weft_db::queries::workflows as workflow_db;

use crate::error::EngineError;
use crate::graph::WorkflowDefinition;
use crate::humantask::TaskManager;
use crate::nodes::ExecutorRegistry;
use crate::notify::{NotifyEvent, NotifyMessage, Notifier};

pub use run::{Failure, Interrupt};

/// Tunable engine parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum sub-workflow nesting depth.
    pub max_subworkflow_depth: i32,
    /// Concurrent node evaluations per execution.
    pub node_parallelism: usize,
    /// Delays at or above this become timer suspensions instead of in-place
    /// sleeps.
    pub delay_suspend_threshold_ms: u64,
    /// Default timeout for HTTP action nodes.
    pub http_timeout: Duration,
    /// Default timeout for code nodes.
    pub code_timeout: Duration,
    /// Worker poll interval when the queue is empty.
    pub worker_poll_interval: Duration,
    /// Claims older than this with no progress are re-queued.
    pub claim_ttl_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_subworkflow_depth: 5,
            node_parallelism: 16,
            delay_suspend_threshold_ms: 60_000,
            http_timeout: Duration::from_secs(30),
            code_timeout: Duration::from_secs(30),
            worker_poll_interval: Duration::from_millis(500),
            claim_ttl_secs: 300,
        }
    }
}

/// Snapshot returned by [`Engine::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionSnapshot {
    pub execution: Execution,
    pub nodes: Vec<NodeExecution>,
}

/// The engine.
#[derive(Clone)]
pub struct Engine {
    pool: PgPool,
    registry: Arc<ExecutorRegistry>,
    tasks: TaskManager,
    notifier: Notifier,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        pool: PgPool,
        registry: Arc<ExecutorRegistry>,
        tasks: TaskManager,
        notifier: Notifier,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            tasks,
            notifier,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create an execution in `pending` (enqueue it for a worker).
    ///
    /// Fails `PreconditionFailed` when the workflow is not active — except
    /// for sub-workflow invocations that target an explicit version, which
    /// may run any version. Fails `DepthLimitExceeded` /
    /// `CyclicSubWorkflow` on sub-workflow misuse.
    pub async fn start(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        version: Option<i32>,
        trigger_type: TriggerType,
        trigger_payload: Value,
        parent: Option<(&Execution, &str)>,
    ) -> Result<Execution, EngineError> {
        let workflow = workflow_db::get_workflow(&self.pool, tenant_id, workflow_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id} not found")))?;

        let pinned_subworkflow =
            trigger_type == TriggerType::Subworkflow && version.is_some();
        if workflow.status != WorkflowStatus::Active && !pinned_subworkflow {
            return Err(EngineError::PreconditionFailed(format!(
                "workflow {workflow_id} is {}, not active",
                workflow.status
            )));
        }

        let version = version.unwrap_or(workflow.version);
        workflow_db::get_version(&self.pool, tenant_id, workflow_id, version)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "workflow {workflow_id} has no version {version}"
                ))
            })?;

        let (parent_execution_id, parent_node_id, depth) = match parent {
            Some((parent, node_id)) => {
                let depth = parent.depth + 1;
                if depth > self.config.max_subworkflow_depth {
                    return Err(EngineError::DepthLimitExceeded(
                        self.config.max_subworkflow_depth,
                    ));
                }
                self.check_invocation_cycle(workflow_id, parent).await?;
                (Some(parent.id), Some(node_id), depth)
            }
            None => (None, None, 0),
        };

        let execution = execution_db::insert_execution(
            &self.pool,
            &NewExecution {
                tenant_id,
                workflow_id,
                workflow_version: version,
                trigger_type,
                trigger_payload: &trigger_payload,
                parent_execution_id,
                parent_node_id: parent_node_id.as_deref(),
                depth,
            },
        )
        .await
        .map_err(EngineError::internal)?;

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %workflow_id,
            trigger = %trigger_type,
            "execution enqueued"
        );

        Ok(execution)
    }

    /// Walk the parent chain; invoking a workflow already on it is a cycle.
    async fn check_invocation_cycle(
        &self,
        workflow_id: Uuid,
        parent: &Execution,
    ) -> Result<(), EngineError> {
        let mut current = Some(parent.clone());
        while let Some(execution) = current {
            if execution.workflow_id == workflow_id {
                return Err(EngineError::CyclicSubWorkflow(workflow_id));
            }
            current = match execution.parent_execution_id {
                Some(parent_id) => execution_db::get_execution_any(&self.pool, parent_id)
                    .await
                    .map_err(EngineError::internal)?,
                None => None,
            };
        }
        Ok(())
    }

    /// Cancel a non-terminal execution: terminal status, pending human
    /// tasks cancelled, child executions cancelled recursively.
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<Execution, EngineError> {
        let cancelled = execution_db::mark_cancelled(&self.pool, tenant_id, execution_id, reason)
            .await
            .map_err(EngineError::internal)?;

        let Some(cancelled) = cancelled else {
            let existing = execution_db::get_execution(&self.pool, tenant_id, execution_id)
                .await
                .map_err(EngineError::internal)?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("execution {execution_id} not found"))
                })?;
            return Err(EngineError::PreconditionFailed(format!(
                "execution {execution_id} is already {}",
                existing.status
            )));
        };

        tracing::info!(execution_id = %execution_id, reason = %reason, "execution cancelled");
        self.tasks.cancel_for_execution(execution_id).await?;

        // Cascade to children (sub-workflows), depth-first.
        let mut stack = vec![execution_id];
        while let Some(parent_id) = stack.pop() {
            let children = execution_db::non_terminal_children(&self.pool, parent_id)
                .await
                .map_err(EngineError::internal)?;
            for child in children {
                if execution_db::mark_cancelled(
                    &self.pool,
                    child.tenant_id,
                    child.id,
                    "parent execution cancelled",
                )
                .await
                .map_err(EngineError::internal)?
                .is_some()
                {
                    tracing::info!(execution_id = %child.id, "child execution cancelled");
                    self.tasks.cancel_for_execution(child.id).await?;
                    stack.push(child.id);
                }
            }
        }

        Ok(cancelled)
    }

    /// Resume a suspended execution at a named wait point.
    ///
    /// A no-op on terminal executions per the resume contract.
    pub async fn resume(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        resume_point: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let execution = execution_db::get_execution(&self.pool, tenant_id, execution_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id} not found")))?;

        if execution.status.is_terminal() {
            return Ok(());
        }
        if execution.status != ExecutionStatus::Suspended {
            return Err(EngineError::PreconditionFailed(format!(
                "execution {execution_id} is {}, not suspended",
                execution.status
            )));
        }

        execution_db::resume_to_pending(&self.pool, execution_id, resume_point, &value)
            .await
            .map_err(EngineError::internal)?;

        tracing::info!(
            execution_id = %execution_id,
            resume_point = %resume_point,
            "execution resumed"
        );
        Ok(())
    }

    /// Current state snapshot: the execution row plus its node evaluations.
    pub async fn status(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<ExecutionSnapshot, EngineError> {
        let execution = execution_db::get_execution(&self.pool, tenant_id, execution_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id} not found")))?;

        let nodes = node_db::list_for_execution(&self.pool, execution_id)
            .await
            .map_err(EngineError::internal)?;

        Ok(ExecutionSnapshot { execution, nodes })
    }

    /// Drive one claimed execution to completion, suspension, or failure.
    pub async fn drive_execution(&self, execution: Execution) {
        let execution_id = execution.id;
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %execution.workflow_id,
            "driving execution"
        );

        // Watch for an API-side cancel while we run.
        let cancel = CancellationToken::new();
        let watcher = {
            let pool = self.pool.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    match execution_db::get_execution_any(&pool, execution_id).await {
                        Ok(Some(row)) if row.status == ExecutionStatus::Cancelled => {
                            token.cancel();
                            break;
                        }
                        Ok(Some(_)) => {}
                        _ => break,
                    }
                }
            })
        };

        let result = self.run_traversal(&execution, cancel.clone()).await;
        watcher.abort();

        match result {
            Ok(output) => {
                let rows = execution_db::mark_completed(&self.pool, execution_id, &output)
                    .await
                    .unwrap_or(0);
                if rows > 0 {
                    tracing::info!(execution_id = %execution_id, "execution completed");
                    self.notify_execution(&execution, "completed", None);
                    self.resume_parent(&execution, "completed").await;
                }
            }
            Err(Interrupt::Suspend { node_id, wake_at }) => {
                let rows = execution_db::suspend(&self.pool, execution_id, &node_id, wake_at)
                    .await
                    .unwrap_or(0);
                if rows > 0 {
                    tracing::info!(
                        execution_id = %execution_id,
                        resume_node = %node_id,
                        "execution suspended"
                    );
                }
            }
            Err(Interrupt::Cancelled) => {
                // The row reached `cancelled` through the API; nothing to
                // write here.
                tracing::info!(execution_id = %execution_id, "execution run aborted by cancel");
            }
            Err(Interrupt::Failed(failure)) => {
                let message = format!("node {}: {}", failure.node_id, failure.error);
                let rows = execution_db::mark_failed(&self.pool, execution_id, &message)
                    .await
                    .unwrap_or(0);
                if rows > 0 {
                    tracing::warn!(
                        execution_id = %execution_id,
                        node_id = %failure.node_id,
                        error = %failure.error,
                        "execution failed"
                    );
                    self.notify_execution(&execution, "failed", Some(&message));
                    self.resume_parent(&execution, "failed").await;
                }
            }
        }
    }

    async fn run_traversal(
        &self,
        execution: &Execution,
        cancel: CancellationToken,
    ) -> Result<Value, Interrupt> {
        let version = workflow_db::get_version(
            &self.pool,
            execution.tenant_id,
            execution.workflow_id,
            execution.workflow_version,
        )
        .await
        .map_err(|e| Interrupt::internal("load definition", e))?
        .ok_or_else(|| {
            Interrupt::Failed(Failure {
                node_id: String::new(),
                error: EngineError::Internal(format!(
                    "definition for workflow {} version {} is missing",
                    execution.workflow_id, execution.workflow_version
                )),
            })
        })?;

        let definition = WorkflowDefinition::from_value(&version.definition).map_err(|e| {
            Interrupt::Failed(Failure {
                node_id: String::new(),
                error: EngineError::Internal(format!("stored definition is malformed: {e}")),
            })
        })?;

        // Seed completed outputs so resumed executions replay instead of
        // re-running side effects.
        let completed = node_db::latest_completed_outputs(&self.pool, execution.id)
            .await
            .map_err(|e| Interrupt::internal("load completed outputs", e))?;

        let runner = run::Runner::new(
            self,
            execution,
            definition,
            completed.into_iter().collect(),
            cancel,
        );
        runner.run().await
    }

    /// When a child execution reaches a terminal state, wake the suspended
    /// parent so its sub-workflow node can observe the result.
    async fn resume_parent(&self, execution: &Execution, status: &str) {
        let (Some(parent_id), Some(parent_node)) = (
            execution.parent_execution_id,
            execution.parent_node_id.as_deref(),
        ) else {
            return;
        };

        let payload = json!({
            "child_execution_id": execution.id,
            "status": status,
        });
        match execution_db::resume_to_pending(&self.pool, parent_id, parent_node, &payload).await {
            Ok(rows) if rows > 0 => {
                tracing::info!(
                    execution_id = %parent_id,
                    child = %execution.id,
                    "parent execution resumed"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(execution_id = %parent_id, error = %e, "failed to resume parent");
            }
        }
    }

    fn notify_execution(&self, execution: &Execution, status: &str, error: Option<&str>) {
        self.notifier.notify(NotifyMessage {
            tenant_id: execution.tenant_id,
            event: NotifyEvent::WorkflowExecution,
            title: format!("Execution {status}"),
            body: error.map(str::to_owned),
            recipients: Vec::new(),
            payload: json!({
                "execution_id": execution.id,
                "workflow_id": execution.workflow_id,
                "status": status,
                "error": error,
            }),
        });
    }

    pub(crate) fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }
}

/// One engine worker: claim pending executions and drive them, until
/// cancelled.
pub async fn run_worker(engine: Arc<Engine>, worker_id: String, cancel: CancellationToken) {
    tracing::info!(worker = %worker_id, "engine worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let claimed = match execution_db::claim_next_pending(engine.pool(), &worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(worker = %worker_id, error = %e, "claim failed");
                None
            }
        };

        match claimed {
            Some(execution) => {
                engine.drive_execution(execution).await;
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(engine.config().worker_poll_interval) => {}
                }
            }
        }
    }

    tracing::info!(worker = %worker_id, "engine worker stopped");
}

/// Maintenance loop: wake due timers and re-queue stale claims.
pub async fn run_maintenance(
    pool: PgPool,
    claim_ttl_secs: i64,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("engine maintenance loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match execution_db::wake_due_timers(&pool, Utc::now()).await {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!(count = ids.len(), "woke due timers");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "timer wake failed"),
        }

        match execution_db::reap_stale_claims(&pool, claim_ttl_secs).await {
            Ok(reaped) => {
                for execution in &reaped {
                    tracing::warn!(
                        execution_id = %execution.id,
                        "re-queued execution with stale claim"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "stale claim reap failed"),
        }
    }

    tracing::info!("engine maintenance loop stopped");
}
