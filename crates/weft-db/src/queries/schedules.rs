//! Database query functions for the `schedules` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{OverlapPolicy, Schedule};

/// Fields for a new schedule row.
#[derive(Debug, Clone)]
pub struct NewSchedule<'a> {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub cron_expression: &'a str,
    pub timezone: &'a str,
    pub overlap_policy: OverlapPolicy,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Insert a new schedule row.
pub async fn insert_schedule(pool: &PgPool, new: &NewSchedule<'_>) -> Result<Schedule> {
    let schedule = sqlx::query_as::<_, Schedule>(
        "INSERT INTO schedules \
         (tenant_id, workflow_id, cron_expression, timezone, overlap_policy, enabled, next_run_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.workflow_id)
    .bind(new.cron_expression)
    .bind(new.timezone)
    .bind(new.overlap_policy)
    .bind(new.enabled)
    .bind(new.next_run_at)
    .fetch_one(pool)
    .await
    .context("failed to insert schedule")?;

    Ok(schedule)
}

/// Fetch a single schedule by ID, scoped to a tenant.
pub async fn get_schedule(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch schedule")?;

    Ok(schedule)
}

/// List all schedules of a workflow.
pub async fn list_for_workflow(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Uuid,
) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE tenant_id = $1 AND workflow_id = $2 \
         ORDER BY created_at ASC",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list schedules for workflow")?;

    Ok(schedules)
}

/// Replace the mutable fields of a schedule.
#[allow(clippy::too_many_arguments)]
pub async fn update_schedule(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    cron_expression: &str,
    timezone: &str,
    overlap_policy: OverlapPolicy,
    enabled: bool,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>(
        "UPDATE schedules \
         SET cron_expression = $1, timezone = $2, overlap_policy = $3, \
             enabled = $4, next_run_at = $5 \
         WHERE tenant_id = $6 AND id = $7 \
         RETURNING *",
    )
    .bind(cron_expression)
    .bind(timezone)
    .bind(overlap_policy)
    .bind(enabled)
    .bind(next_run_at)
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to update schedule")?;

    Ok(schedule)
}

/// Delete a schedule.
pub async fn delete_schedule(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM schedules WHERE tenant_id = $1 AND id = $2")
        .bind(tenant_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete schedule")?;

    Ok(result.rows_affected())
}

/// Enabled schedules that are due, oldest first. Serves all tenants
/// (dispatcher, under its lease).
pub async fn due_schedules(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1 \
         ORDER BY next_run_at ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list due schedules")?;

    Ok(schedules)
}

/// Record a dispatch: stamp `last_run_at` / `last_execution_id` and advance
/// `next_run_at`.
pub async fn record_dispatch(
    pool: &PgPool,
    id: Uuid,
    last_run_at: DateTime<Utc>,
    last_execution_id: Uuid,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE schedules \
         SET last_run_at = $1, last_execution_id = $2, next_run_at = $3 \
         WHERE id = $4",
    )
    .bind(last_run_at)
    .bind(last_execution_id)
    .bind(next_run_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record schedule dispatch")?;

    Ok(result.rows_affected())
}

/// Advance `next_run_at` without dispatching (skip overlap policy).
pub async fn set_next_run(
    pool: &PgPool,
    id: Uuid,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE schedules SET next_run_at = $1 WHERE id = $2")
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set schedule next run")?;

    Ok(result.rows_affected())
}
