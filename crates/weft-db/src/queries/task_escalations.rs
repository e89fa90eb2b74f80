//! Database query functions for the `task_escalations` table.
//!
//! Escalations are written transactionally together with the task mutations
//! in [`super::human_tasks`]; this module holds the read side and the
//! manual-escalation insert.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskEscalation;

/// List the escalation history of a task, oldest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEscalation>> {
    let rows = sqlx::query_as::<_, TaskEscalation>(
        "SELECT * FROM task_escalations \
         WHERE task_id = $1 \
         ORDER BY escalated_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task escalations")?;

    Ok(rows)
}

/// Fetch the currently active escalation of a task, if any.
pub async fn get_active(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskEscalation>> {
    let row = sqlx::query_as::<_, TaskEscalation>(
        "SELECT * FROM task_escalations \
         WHERE task_id = $1 AND status = 'active'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active escalation")?;

    Ok(row)
}

/// Count escalations of a task.
pub async fn count_for_task(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_escalations WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .context("failed to count task escalations")?;

    Ok(row.0)
}
