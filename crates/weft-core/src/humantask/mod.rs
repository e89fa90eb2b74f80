//! The human-task manager: task lifecycle, assignee authorization, and the
//! integration point between approvals and engine suspension.
//!
//! Completion and escalation are mutually exclusive by construction: every
//! mutation goes through a compare-and-set on the task's `version` column
//! (see `weft_db::queries::human_tasks`), so a user approval racing the
//! overdue scanner resolves with one winner and one observed conflict.

pub mod escalation;

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use weft_db::models::{Execution, HumanTask, TaskStatus, TaskType};
use weft_db::queries::human_tasks as task_db;
use weft_db::queries::human_tasks::CasOutcome;
use weft_db::queries::task_escalations as escalation_db;

use crate::error::EngineError;
use crate::notify::{NotifyEvent, NotifyMessage, Notifier};

/// Parsed config of a `human:task` node (stored verbatim on the task row).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskNodeConfig {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Minutes until the task is overdue. Absent means no deadline.
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
    /// Legacy single-shot timeout behavior when no escalation plan exists:
    /// `auto_approve`, `auto_reject`, `escalate`, or `expire`.
    #[serde(default)]
    pub on_timeout: Option<String>,
    /// Legacy escalation target for `on_timeout = "escalate"`.
    #[serde(default)]
    pub escalate_to: Vec<String>,
    #[serde(default)]
    pub escalation: Option<EscalationPlan>,
}

/// Multi-level escalation plan.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationPlan {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub levels: Vec<EscalationLevel>,
    /// Terminal outcome once every level is exhausted:
    /// `auto_approve`, `auto_reject`, or `expire` (the default).
    #[serde(default)]
    pub final_action: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One escalation level.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationLevel {
    pub level: i32,
    pub timeout_minutes: i64,
    #[serde(default)]
    pub backup_approvers: Vec<String>,
    #[serde(default = "default_enabled")]
    pub notify_on_escalate: bool,
}

impl TaskNodeConfig {
    pub fn parse(config: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(config.clone())
            .map_err(|e| EngineError::Validation(format!("invalid human task config: {e}")))
    }

    fn parsed_task_type(&self) -> TaskType {
        self.task_type
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(TaskType::Approval)
    }

    fn active_plan(&self) -> Option<&EscalationPlan> {
        self.escalation
            .as_ref()
            .filter(|p| p.enabled && !p.levels.is_empty())
    }

    fn max_escalation_level(&self) -> i32 {
        self.active_plan()
            .map(|p| p.levels.iter().map(|l| l.level).max().unwrap_or(0))
            .unwrap_or(0)
    }

    fn level(&self, level: i32) -> Option<&EscalationLevel> {
        self.active_plan()
            .and_then(|p| p.levels.iter().find(|l| l.level == level))
    }
}

/// User action completing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Approve,
    Reject,
    Submit,
}

impl TaskAction {
    fn terminal_status(self) -> TaskStatus {
        match self {
            Self::Approve | Self::Submit => TaskStatus::Approved,
            Self::Reject => TaskStatus::Rejected,
        }
    }
}

/// Owns the HumanTask lifecycle.
#[derive(Clone)]
pub struct TaskManager {
    pool: PgPool,
    notifier: Notifier,
}

impl TaskManager {
    pub fn new(pool: PgPool, notifier: Notifier) -> Self {
        Self { pool, notifier }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the task for a `human:task` node reached by an execution.
    ///
    /// Idempotent per `(execution_id, step_id)`: replayed traversals get
    /// the existing row back. Returns `(task, created)`.
    pub async fn create_for_node(
        &self,
        execution: &Execution,
        step_id: &str,
        config: &Value,
    ) -> Result<(HumanTask, bool), EngineError> {
        let parsed = TaskNodeConfig::parse(config)?;

        let due_date = parsed
            .timeout_minutes
            .map(|minutes| Utc::now() + Duration::minutes(minutes));

        let title = parsed
            .title
            .clone()
            .unwrap_or_else(|| format!("Approval required: {step_id}"));
        let assignees = json!(parsed.assignees);

        let new_task = task_db::NewHumanTask {
            tenant_id: execution.tenant_id,
            execution_id: execution.id,
            step_id,
            task_type: parsed.parsed_task_type(),
            title: &title,
            description: parsed.description.as_deref(),
            assignees: &assignees,
            due_date,
            max_escalation_level: parsed.max_escalation_level(),
            config,
        };

        let (task, created) = task_db::insert_or_get(&self.pool, &new_task)
            .await
            .map_err(EngineError::internal)?;

        if created {
            tracing::info!(
                task_id = %task.id,
                execution_id = %execution.id,
                step_id = %step_id,
                "created human task"
            );
            self.notifier.notify(NotifyMessage {
                tenant_id: task.tenant_id,
                event: NotifyEvent::TaskAssigned,
                title: task.title.clone(),
                body: task.description.clone(),
                recipients: task.assignee_list(),
                payload: json!({
                    "task_id": task.id,
                    "execution_id": task.execution_id,
                    "due_date": task.due_date,
                }),
            });
        }

        Ok((task, created))
    }

    /// Fetch a task, tenant-scoped.
    pub async fn get(&self, tenant_id: Uuid, task_id: Uuid) -> Result<HumanTask, EngineError> {
        task_db::get_task(&self.pool, tenant_id, task_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id} not found")))
    }

    /// Complete a pending task on behalf of a user.
    ///
    /// Only assignees (by user id or any matching role) may complete. The
    /// terminal transition, escalation bookkeeping and execution resume
    /// commit atomically; a lost race against the scanner is a `Conflict`.
    pub async fn complete(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
        action: TaskAction,
        user_id: &str,
        roles: &[String],
        payload: Option<Value>,
    ) -> Result<HumanTask, EngineError> {
        let task = self.get(tenant_id, task_id).await?;

        if task.status != TaskStatus::Pending {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is {}, not pending",
                task.status
            )));
        }

        let assignees = task.assignee_list();
        let authorized =
            assignees.iter().any(|a| a == user_id) || assignees.iter().any(|a| roles.contains(a));
        if !authorized {
            return Err(EngineError::Forbidden(format!(
                "user {user_id} is not an assignee of task {task_id}"
            )));
        }

        let status = action.terminal_status();
        let resume_payload = json!({
            "status": status.to_string(),
            "response": &payload,
            "completed_by": user_id,
        });

        let outcome = task_db::complete_task(
            &self.pool,
            &task,
            status,
            user_id,
            payload.as_ref(),
            &resume_payload,
        )
        .await
        .map_err(EngineError::internal)?;

        let updated = match outcome {
            CasOutcome::Applied(task) => *task,
            CasOutcome::Conflict => {
                return Err(EngineError::Conflict(format!(
                    "task {task_id} was modified concurrently"
                )));
            }
        };

        tracing::info!(
            task_id = %task_id,
            status = %updated.status,
            completed_by = %user_id,
            "human task completed"
        );
        self.notifier.notify(NotifyMessage {
            tenant_id,
            event: NotifyEvent::TaskCompleted,
            title: format!("Task {} {}", updated.title, updated.status),
            body: None,
            recipients: updated.assignee_list(),
            payload: json!({ "task_id": task_id, "status": updated.status }),
        });

        Ok(updated)
    }

    /// Cancel one pending task (operator action).
    ///
    /// The owning execution is resumed with the cancelled status; its
    /// human-task node observes the terminal task and fails, so the
    /// execution does not hang on a wait that can never complete.
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
        user_id: &str,
    ) -> Result<HumanTask, EngineError> {
        let task = self.get(tenant_id, task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is {}, not pending",
                task.status
            )));
        }

        let resume_payload = json!({ "status": "cancelled", "completed_by": user_id });
        let outcome = task_db::complete_task(
            &self.pool,
            &task,
            TaskStatus::Cancelled,
            user_id,
            None,
            &resume_payload,
        )
        .await
        .map_err(EngineError::internal)?;

        match outcome {
            CasOutcome::Applied(task) => {
                tracing::info!(task_id = %task_id, cancelled_by = %user_id, "human task cancelled");
                Ok(*task)
            }
            CasOutcome::Conflict => Err(EngineError::Conflict(format!(
                "task {task_id} was modified concurrently"
            ))),
        }
    }

    /// Cancel every pending task of an execution (engine-initiated, when
    /// the owning execution is cancelled). Unlike [`Self::complete`] this
    /// does not resume the execution.
    pub async fn cancel_for_execution(&self, execution_id: Uuid) -> Result<usize, EngineError> {
        let cancelled = task_db::cancel_for_execution(&self.pool, execution_id)
            .await
            .map_err(EngineError::internal)?;
        for task in &cancelled {
            tracing::info!(task_id = %task.id, execution_id = %execution_id, "cancelled human task");
        }
        Ok(cancelled.len())
    }

    /// Manually escalate a pending task one level.
    pub async fn escalate_manual(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<HumanTask, EngineError> {
        let task = self.get(tenant_id, task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is {}, not pending",
                task.status
            )));
        }

        let config = TaskNodeConfig::parse(&task.config)?;
        if task.escalation_level >= task.max_escalation_level {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is already at its highest escalation level"
            )));
        }

        escalation::raise_level(
            &self.pool,
            &self.notifier,
            &task,
            &config,
            weft_db::models::EscalationReason::Manual,
        )
        .await?
        .ok_or_else(|| EngineError::Conflict(format!("task {task_id} was modified concurrently")))
    }

    /// Escalation history of a task.
    pub async fn escalations(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<Vec<weft_db::models::TaskEscalation>, EngineError> {
        // Existence check keeps the history endpoint tenant-scoped.
        self.get(tenant_id, task_id).await?;
        escalation_db::list_for_task(&self.pool, task_id)
            .await
            .map_err(EngineError::internal)
    }

    /// Scan for overdue tasks and run the escalation state machine on each.
    ///
    /// `tenant_id = None` scans every tenant (the background scanner);
    /// `Some` limits to one tenant (the API surface). Returns the number of
    /// tasks acted on.
    pub async fn process_overdue(
        &self,
        tenant_id: Option<Uuid>,
        limit: i64,
    ) -> Result<usize, EngineError> {
        let now = Utc::now();
        let overdue = match tenant_id {
            Some(tenant) => task_db::list_overdue_for_tenant(&self.pool, tenant, now, limit).await,
            None => task_db::list_overdue(&self.pool, now, limit).await,
        }
        .map_err(EngineError::internal)?;

        let mut processed = 0;
        for task in overdue {
            match escalation::handle_overdue(&self.pool, &self.notifier, &task).await {
                Ok(true) => processed += 1,
                Ok(false) => {
                    // Lost a race with a completion; the next scan re-reads.
                    tracing::debug!(task_id = %task.id, "overdue handling lost optimistic race");
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "overdue handling failed");
                }
            }
        }
        Ok(processed)
    }
}
