//! The multi-level escalation state machine and the overdue scanner loop.
//!
//! Transition table for a pending task whose `due_date` has passed:
//!
//! - escalation plan, `level < max_level`: raise one level (new assignees,
//!   new deadline, active escalation record superseding the prior one);
//! - escalation plan, `level = max_level`: apply the plan's final action as
//!   a terminal transition by `system` and resume the execution;
//! - no plan (legacy): apply `on_timeout` — `escalate` raises once to
//!   `escalate_to`, a second overdue expires the task.
//!
//! Every arm is one compare-and-set transaction; `false` means the task
//! changed underneath us (usually a user completion winning the race).

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use weft_db::models::{EscalationReason, HumanTask, TaskStatus};
use weft_db::queries::human_tasks as task_db;
use weft_db::queries::human_tasks::CasOutcome;
use weft_db::queries::leases;

use crate::error::EngineError;
use crate::notify::{NotifyEvent, NotifyMessage, Notifier};

use super::TaskNodeConfig;

/// Default legacy deadline extension when `escalate` has no level plan.
const LEGACY_ESCALATION_MINUTES: i64 = 60;

/// Run the state machine on one overdue task. Returns `false` when the
/// optimistic check lost a race.
pub async fn handle_overdue(
    pool: &PgPool,
    notifier: &Notifier,
    task: &HumanTask,
) -> Result<bool, EngineError> {
    let config = TaskNodeConfig::parse(&task.config).unwrap_or_default();

    if config.active_plan().is_some() {
        if task.escalation_level < task.max_escalation_level {
            return Ok(raise_level(pool, notifier, task, &config, EscalationReason::Timeout)
                .await?
                .is_some());
        }
        let final_action = config
            .active_plan()
            .and_then(|p| p.final_action.as_deref())
            .unwrap_or("expire");
        return finalize(pool, notifier, task, final_action).await;
    }

    // Legacy single-shot timeout handling.
    match config.on_timeout.as_deref() {
        Some("auto_approve") => finalize(pool, notifier, task, "auto_approve").await,
        Some("auto_reject") => finalize(pool, notifier, task, "auto_reject").await,
        Some("escalate") if task.escalation_level == 0 => {
            let assignees = if config.escalate_to.is_empty() {
                task.assignee_list()
            } else {
                config.escalate_to.clone()
            };
            let timeout = config.timeout_minutes.unwrap_or(LEGACY_ESCALATION_MINUTES);
            let due = Utc::now() + Duration::minutes(timeout);
            let outcome = task_db::escalate_task(
                pool,
                task,
                1,
                &json!(assignees),
                due,
                EscalationReason::Timeout,
                Some(timeout as i32),
            )
            .await
            .map_err(EngineError::internal)?;
            Ok(notify_if_escalated(notifier, task, outcome, &assignees))
        }
        // Second overdue after a legacy escalation, or no timeout config at
        // all: expire.
        _ => finalize(pool, notifier, task, "expire").await,
    }
}

/// Raise a task to the next escalation level per its plan.
///
/// Returns the updated task, or `None` on a lost optimistic race.
pub async fn raise_level(
    pool: &PgPool,
    notifier: &Notifier,
    task: &HumanTask,
    config: &TaskNodeConfig,
    reason: EscalationReason,
) -> Result<Option<HumanTask>, EngineError> {
    let next = task.escalation_level + 1;
    let Some(level) = config.level(next) else {
        return Err(EngineError::Internal(format!(
            "task {} has no escalation level {next} in its plan",
            task.id
        )));
    };

    let assignees = json!(level.backup_approvers);
    let due = Utc::now() + Duration::minutes(level.timeout_minutes);

    let outcome = task_db::escalate_task(
        pool,
        task,
        next,
        &assignees,
        due,
        reason,
        Some(level.timeout_minutes as i32),
    )
    .await
    .map_err(EngineError::internal)?;

    match outcome {
        CasOutcome::Applied(updated) => {
            tracing::info!(
                task_id = %task.id,
                level = next,
                reason = %reason,
                "escalated human task"
            );
            if level.notify_on_escalate {
                notifier.notify(NotifyMessage {
                    tenant_id: task.tenant_id,
                    event: NotifyEvent::TaskEscalated,
                    title: format!("Task escalated: {}", task.title),
                    body: None,
                    recipients: level.backup_approvers.clone(),
                    payload: json!({
                        "task_id": task.id,
                        "escalation_level": next,
                        "due_date": due,
                    }),
                });
            }
            Ok(Some(*updated))
        }
        CasOutcome::Conflict => Ok(None),
    }
}

/// Apply a final action as a terminal transition by `system`, record the
/// completed escalation with `auto_action_taken`, and resume the execution.
async fn finalize(
    pool: &PgPool,
    notifier: &Notifier,
    task: &HumanTask,
    action: &str,
) -> Result<bool, EngineError> {
    let status = match action {
        "auto_approve" => TaskStatus::Approved,
        "auto_reject" => TaskStatus::Rejected,
        _ => TaskStatus::Expired,
    };

    let response = json!({ "auto": true, "action": action });
    let resume_payload = json!({
        "status": status.to_string(),
        "response": response,
        "completed_by": "system",
        "auto_action": action,
    });

    let outcome = task_db::finalize_task(
        pool,
        task,
        status,
        action,
        Some(&response),
        &resume_payload,
    )
    .await
    .map_err(EngineError::internal)?;

    match outcome {
        CasOutcome::Applied(updated) => {
            tracing::info!(
                task_id = %task.id,
                action = %action,
                status = %updated.status,
                "applied final action to overdue task"
            );
            notifier.notify(NotifyMessage {
                tenant_id: task.tenant_id,
                event: NotifyEvent::TaskOverdue,
                title: format!("Task {}: {}", updated.status, task.title),
                body: None,
                recipients: task.assignee_list(),
                payload: json!({ "task_id": task.id, "auto_action": action }),
            });
            Ok(true)
        }
        CasOutcome::Conflict => Ok(false),
    }
}

fn notify_if_escalated(
    notifier: &Notifier,
    task: &HumanTask,
    outcome: CasOutcome,
    assignees: &[String],
) -> bool {
    match outcome {
        CasOutcome::Applied(_) => {
            notifier.notify(NotifyMessage {
                tenant_id: task.tenant_id,
                event: NotifyEvent::TaskEscalated,
                title: format!("Task escalated: {}", task.title),
                body: None,
                recipients: assignees.to_vec(),
                payload: json!({ "task_id": task.id, "escalation_level": 1 }),
            });
            true
        }
        CasOutcome::Conflict => false,
    }
}

/// The periodic overdue scanner.
///
/// Takes the shared `overdue-scanner` lease each tick so only one process
/// scans at a time, then runs the state machine over due tasks.
pub async fn run_overdue_scanner(
    manager: super::TaskManager,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let owner = format!("scanner-{}", uuid::Uuid::new_v4().simple());
    tracing::info!(owner = %owner, "overdue scanner started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match leases::acquire(manager.pool(), "overdue-scanner", &owner, 30).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "overdue scanner lease acquisition failed");
                continue;
            }
        }

        match manager.process_overdue(None, 100).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(processed = n, "overdue scanner processed tasks"),
            Err(e) => tracing::warn!(error = %e, "overdue scan failed"),
        }
    }

    let _ = leases::release(manager.pool(), "overdue-scanner", &owner).await;
    tracing::info!("overdue scanner stopped");
}
