//! Database query functions for the `human_tasks` table.
//!
//! Every mutation is optimistic-locked on `(status = 'pending', version)` so
//! that a user completion racing with the escalation scanner resolves
//! cleanly: the loser's compare-and-set affects zero rows.
//!
//! The multi-row operations (completion, escalation, final action) each run
//! in a single transaction that also updates the escalation records and,
//! for terminal transitions, re-enqueues the suspended parent execution.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{EscalationReason, HumanTask, TaskStatus, TaskType};

/// Fields for a new human task row.
#[derive(Debug, Clone)]
pub struct NewHumanTask<'a> {
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: &'a str,
    pub task_type: TaskType,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub assignees: &'a serde_json::Value,
    pub due_date: Option<DateTime<Utc>>,
    pub max_escalation_level: i32,
    pub config: &'a serde_json::Value,
}

/// Insert a task, or return the existing one for `(execution_id, step_id)`.
///
/// Replay-based resume re-visits human-task nodes, so creation must be
/// idempotent. Returns `(task, created)`.
pub async fn insert_or_get(pool: &PgPool, new: &NewHumanTask<'_>) -> Result<(HumanTask, bool)> {
    let inserted = sqlx::query_as::<_, HumanTask>(
        "INSERT INTO human_tasks \
         (tenant_id, execution_id, step_id, task_type, title, description, \
          assignees, due_date, max_escalation_level, config) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (execution_id, step_id) DO NOTHING \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.execution_id)
    .bind(new.step_id)
    .bind(new.task_type)
    .bind(new.title)
    .bind(new.description)
    .bind(new.assignees)
    .bind(new.due_date)
    .bind(new.max_escalation_level)
    .bind(new.config)
    .fetch_optional(pool)
    .await
    .context("failed to insert human task")?;

    if let Some(task) = inserted {
        return Ok((task, true));
    }

    let existing = get_by_step(pool, new.execution_id, new.step_id)
        .await?
        .context("human task vanished between insert and fetch")?;
    Ok((existing, false))
}

/// Fetch a single task by ID, scoped to a tenant.
pub async fn get_task(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<HumanTask>> {
    let task = sqlx::query_as::<_, HumanTask>(
        "SELECT * FROM human_tasks WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch human task")?;

    Ok(task)
}

/// Fetch the task created by a given node of an execution.
pub async fn get_by_step(
    pool: &PgPool,
    execution_id: Uuid,
    step_id: &str,
) -> Result<Option<HumanTask>> {
    let task = sqlx::query_as::<_, HumanTask>(
        "SELECT * FROM human_tasks WHERE execution_id = $1 AND step_id = $2",
    )
    .bind(execution_id)
    .bind(step_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch human task by step")?;

    Ok(task)
}

/// List tasks for a tenant, optionally filtered by status and assignee.
pub async fn list_tasks(
    pool: &PgPool,
    tenant_id: Uuid,
    status: Option<TaskStatus>,
    assignee: Option<&str>,
    limit: i64,
) -> Result<Vec<HumanTask>> {
    let tasks = sqlx::query_as::<_, HumanTask>(
        "SELECT * FROM human_tasks \
         WHERE tenant_id = $1 \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3::text IS NULL OR assignees @> jsonb_build_array($3::text)) \
         ORDER BY created_at DESC \
         LIMIT $4",
    )
    .bind(tenant_id)
    .bind(status.map(|s| s.to_string()))
    .bind(assignee)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list human tasks")?;

    Ok(tasks)
}

/// Pending tasks whose due date has passed, oldest first. Serves all
/// tenants (overdue scanner).
pub async fn list_overdue(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<HumanTask>> {
    let tasks = sqlx::query_as::<_, HumanTask>(
        "SELECT * FROM human_tasks \
         WHERE status = 'pending' AND due_date IS NOT NULL AND due_date < $1 \
         ORDER BY due_date ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list overdue tasks")?;

    Ok(tasks)
}

/// Pending tasks of one tenant whose due date has passed.
pub async fn list_overdue_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<HumanTask>> {
    let tasks = sqlx::query_as::<_, HumanTask>(
        "SELECT * FROM human_tasks \
         WHERE tenant_id = $1 AND status = 'pending' \
           AND due_date IS NOT NULL AND due_date < $2 \
         ORDER BY due_date ASC \
         LIMIT $3",
    )
    .bind(tenant_id)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list overdue tasks for tenant")?;

    Ok(tasks)
}

/// Outcome of a compare-and-set task mutation.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The mutation applied; the updated task is returned.
    Applied(Box<HumanTask>),
    /// The row's status or version no longer matched (lost race).
    Conflict,
}

/// Terminal-transition CAS inside an open transaction.
async fn cas_terminal(
    tx: &mut Transaction<'_, Postgres>,
    task: &HumanTask,
    new_status: TaskStatus,
    completed_by: &str,
    response_data: Option<&serde_json::Value>,
) -> Result<Option<HumanTask>> {
    let updated = sqlx::query_as::<_, HumanTask>(
        "UPDATE human_tasks \
         SET status = $1, completed_at = NOW(), completed_by = $2, \
             response_data = $3, version = version + 1 \
         WHERE id = $4 AND status = 'pending' AND version = $5 \
         RETURNING *",
    )
    .bind(new_status)
    .bind(completed_by)
    .bind(response_data)
    .bind(task.id)
    .bind(task.version)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to transition human task")?;

    Ok(updated)
}

/// Re-enqueue the owning suspended execution with the task response as the
/// resume payload. A no-op when the execution is not suspended (e.g. it was
/// cancelled while the task was open).
async fn resume_owner(
    tx: &mut Transaction<'_, Postgres>,
    task: &HumanTask,
    resume_payload: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE executions \
         SET status = 'pending', resume_node_id = $1, resume_payload = $2, wake_at = NULL \
         WHERE id = $3 AND status = 'suspended'",
    )
    .bind(&task.step_id)
    .bind(resume_payload)
    .bind(task.execution_id)
    .execute(&mut **tx)
    .await
    .context("failed to resume owning execution")?;

    Ok(())
}

/// Complete a pending task (approve / reject / submit) in one transaction:
/// CAS the task terminal, mark its active escalations completed, and resume
/// the suspended parent execution with the response.
pub async fn complete_task(
    pool: &PgPool,
    task: &HumanTask,
    new_status: TaskStatus,
    completed_by: &str,
    response_data: Option<&serde_json::Value>,
    resume_payload: &serde_json::Value,
) -> Result<CasOutcome> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(updated) = cas_terminal(&mut tx, task, new_status, completed_by, response_data).await?
    else {
        tx.rollback().await.ok();
        return Ok(CasOutcome::Conflict);
    };

    sqlx::query(
        "UPDATE task_escalations \
         SET status = 'completed', completed_at = NOW(), completed_by = $1 \
         WHERE task_id = $2 AND status = 'active'",
    )
    .bind(completed_by)
    .bind(task.id)
    .execute(&mut *tx)
    .await
    .context("failed to complete active escalations")?;

    resume_owner(&mut tx, task, resume_payload).await?;

    tx.commit().await.context("failed to commit task completion")?;

    Ok(CasOutcome::Applied(Box::new(updated)))
}

/// Raise a task one escalation level in one transaction: CAS the task's
/// assignees / due date / level, supersede the prior active escalation, and
/// insert the new active record.
#[allow(clippy::too_many_arguments)]
pub async fn escalate_task(
    pool: &PgPool,
    task: &HumanTask,
    next_level: i32,
    new_assignees: &serde_json::Value,
    new_due_date: DateTime<Utc>,
    reason: EscalationReason,
    timeout_minutes: Option<i32>,
) -> Result<CasOutcome> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let updated = sqlx::query_as::<_, HumanTask>(
        "UPDATE human_tasks \
         SET assignees = $1, due_date = $2, escalation_level = $3, \
             last_escalated_at = NOW(), version = version + 1 \
         WHERE id = $4 AND status = 'pending' AND version = $5 \
         RETURNING *",
    )
    .bind(new_assignees)
    .bind(new_due_date)
    .bind(next_level)
    .bind(task.id)
    .bind(task.version)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to escalate human task")?;

    let Some(updated) = updated else {
        tx.rollback().await.ok();
        return Ok(CasOutcome::Conflict);
    };

    sqlx::query(
        "UPDATE task_escalations SET status = 'superseded' \
         WHERE task_id = $1 AND status = 'active'",
    )
    .bind(task.id)
    .execute(&mut *tx)
    .await
    .context("failed to supersede prior escalation")?;

    sqlx::query(
        "INSERT INTO task_escalations \
         (task_id, escalation_level, escalated_from, escalated_to, reason, timeout_minutes) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(task.id)
    .bind(next_level)
    .bind(&task.assignees)
    .bind(new_assignees)
    .bind(reason)
    .bind(timeout_minutes)
    .execute(&mut *tx)
    .await
    .context("failed to insert escalation record")?;

    tx.commit().await.context("failed to commit escalation")?;

    Ok(CasOutcome::Applied(Box::new(updated)))
}

/// Apply a final action (auto-approve / auto-reject / expire) in one
/// transaction: CAS the task terminal as `system`, supersede the active
/// escalation, insert the completed final-action record, and resume the
/// parent execution.
pub async fn finalize_task(
    pool: &PgPool,
    task: &HumanTask,
    new_status: TaskStatus,
    auto_action: &str,
    response_data: Option<&serde_json::Value>,
    resume_payload: &serde_json::Value,
) -> Result<CasOutcome> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(updated) = cas_terminal(&mut tx, task, new_status, "system", response_data).await?
    else {
        tx.rollback().await.ok();
        return Ok(CasOutcome::Conflict);
    };

    sqlx::query(
        "UPDATE task_escalations SET status = 'superseded' \
         WHERE task_id = $1 AND status = 'active'",
    )
    .bind(task.id)
    .execute(&mut *tx)
    .await
    .context("failed to supersede prior escalation")?;

    sqlx::query(
        "INSERT INTO task_escalations \
         (task_id, escalation_level, escalated_from, escalated_to, reason, \
          auto_action_taken, status, completed_at, completed_by) \
         VALUES ($1, $2, $3, $3, 'timeout', $4, 'completed', NOW(), 'system')",
    )
    .bind(task.id)
    .bind(task.escalation_level)
    .bind(&task.assignees)
    .bind(auto_action)
    .execute(&mut *tx)
    .await
    .context("failed to insert final escalation record")?;

    resume_owner(&mut tx, task, resume_payload).await?;

    tx.commit().await.context("failed to commit final action")?;

    Ok(CasOutcome::Applied(Box::new(updated)))
}

/// Cancel every pending task of an execution (engine-initiated when the
/// execution itself is cancelled). Returns the cancelled tasks.
pub async fn cancel_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<Vec<HumanTask>> {
    let tasks = sqlx::query_as::<_, HumanTask>(
        "UPDATE human_tasks \
         SET status = 'cancelled', completed_at = NOW(), completed_by = 'system', \
             version = version + 1 \
         WHERE execution_id = $1 AND status = 'pending' \
         RETURNING *",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to cancel tasks for execution")?;

    Ok(tasks)
}
