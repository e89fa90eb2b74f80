//! Database query functions for the `executions` table.
//!
//! The executions table doubles as the engine's durable work queue: workers
//! claim `pending` rows with `FOR UPDATE SKIP LOCKED`, and every status
//! transition is optimistic-locked on the current status so a row is only
//! ever mutated by the worker holding its claim.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus, TriggerType};

/// Fields for a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub trigger_type: TriggerType,
    pub trigger_payload: &'a serde_json::Value,
    pub parent_execution_id: Option<Uuid>,
    pub parent_node_id: Option<&'a str>,
    pub depth: i32,
}

/// Insert a new execution in `pending` status (enqueue).
pub async fn insert_execution(pool: &PgPool, new: &NewExecution<'_>) -> Result<Execution> {
    let execution = sqlx::query_as::<_, Execution>(
        "INSERT INTO executions \
         (tenant_id, workflow_id, workflow_version, trigger_type, trigger_payload, \
          parent_execution_id, parent_node_id, depth) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.workflow_id)
    .bind(new.workflow_version)
    .bind(new.trigger_type)
    .bind(new.trigger_payload)
    .bind(new.parent_execution_id)
    .bind(new.parent_node_id)
    .bind(new.depth)
    .fetch_one(pool)
    .await
    .context("failed to insert execution")?;

    Ok(execution)
}

/// Fetch a single execution by ID, scoped to a tenant.
pub async fn get_execution(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch execution")?;

    Ok(execution)
}

/// Fetch a single execution by ID without a tenant predicate.
///
/// Engine-internal: used by the worker (which serves all tenants) and by
/// parent/child sub-workflow plumbing where the caller already holds a row
/// that proves ownership.
pub async fn get_execution_any(pool: &PgPool, id: Uuid) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")?;

    Ok(execution)
}

/// List executions for a tenant, optionally filtered by workflow and status,
/// newest first.
pub async fn list_executions(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Option<Uuid>,
    status: Option<ExecutionStatus>,
    limit: i64,
) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions \
         WHERE tenant_id = $1 \
           AND ($2::uuid IS NULL OR workflow_id = $2) \
           AND ($3::text IS NULL OR status = $3) \
         ORDER BY created_at DESC \
         LIMIT $4",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(executions)
}

/// Claim the oldest pending execution for a worker.
///
/// Atomically transitions `pending -> running` and stamps the claim;
/// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from contending on the
/// same row. Serves all tenants.
pub async fn claim_next_pending(pool: &PgPool, worker_id: &str) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "UPDATE executions \
         SET status = 'running', \
             claimed_by = $1, \
             claimed_at = NOW(), \
             started_at = COALESCE(started_at, NOW()) \
         WHERE id = ( \
             SELECT id FROM executions \
             WHERE status = 'pending' \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING *",
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("failed to claim pending execution")?;

    Ok(execution)
}

/// Claim a specific pending execution (sub-workflow inline drive).
pub async fn claim_execution(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "UPDATE executions \
         SET status = 'running', \
             claimed_by = $1, \
             claimed_at = NOW(), \
             started_at = COALESCE(started_at, NOW()) \
         WHERE id = $2 AND status = 'pending' \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to claim execution")?;

    Ok(execution)
}

/// Transition a running execution to `completed` with its final output.
pub async fn mark_completed(
    pool: &PgPool,
    id: Uuid,
    output: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = 'completed', output = $1, completed_at = NOW(), \
             claimed_by = NULL, claimed_at = NULL \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(output)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution completed")?;

    Ok(result.rows_affected())
}

/// Transition a running execution to `failed` with an error message.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = 'failed', error_message = $1, completed_at = NOW(), \
             claimed_by = NULL, claimed_at = NULL \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution failed")?;

    Ok(result.rows_affected())
}

/// Cancel a non-terminal execution. Returns the cancelled row, or `None`
/// when the execution was already terminal (or absent).
pub async fn mark_cancelled(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    reason: &str,
) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "UPDATE executions \
         SET status = 'cancelled', error_message = $1, completed_at = NOW(), \
             claimed_by = NULL, claimed_at = NULL, wake_at = NULL \
         WHERE tenant_id = $2 AND id = $3 \
           AND status IN ('pending', 'running', 'suspended') \
         RETURNING *",
    )
    .bind(reason)
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to cancel execution")?;

    Ok(execution)
}

/// Suspend a running execution at a resume point, releasing the claim.
///
/// `wake_at` is set for timer suspensions (long delays) and left NULL for
/// human-task waits.
pub async fn suspend(
    pool: &PgPool,
    id: Uuid,
    resume_node_id: &str,
    wake_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = 'suspended', resume_node_id = $1, wake_at = $2, \
             claimed_by = NULL, claimed_at = NULL \
         WHERE id = $3 AND status = 'running'",
    )
    .bind(resume_node_id)
    .bind(wake_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to suspend execution")?;

    Ok(result.rows_affected())
}

/// Re-enqueue a suspended execution with a resume payload.
pub async fn resume_to_pending(
    pool: &PgPool,
    id: Uuid,
    resume_node_id: &str,
    resume_payload: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = 'pending', resume_node_id = $1, resume_payload = $2, wake_at = NULL \
         WHERE id = $3 AND status = 'suspended'",
    )
    .bind(resume_node_id)
    .bind(resume_payload)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resume execution")?;

    Ok(result.rows_affected())
}

/// Re-enqueue suspended executions whose timer has come due. Returns the
/// woken execution IDs. Serves all tenants (scanner).
pub async fn wake_due_timers(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE executions \
         SET status = 'pending', wake_at = NULL, \
             resume_payload = COALESCE(resume_payload, '{}'::jsonb) \
                 || '{\"timer_elapsed\": true}'::jsonb \
         WHERE status = 'suspended' AND wake_at IS NOT NULL AND wake_at <= $1 \
         RETURNING id",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to wake due timers")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Re-queue executions whose claim went stale (worker crash recovery).
///
/// The replay traversal makes re-running a partially executed run safe:
/// completed node outputs are restored from the store.
pub async fn reap_stale_claims(pool: &PgPool, older_than_secs: i64) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "UPDATE executions \
         SET status = 'pending', claimed_by = NULL, claimed_at = NULL \
         WHERE status = 'running' \
           AND claimed_at < NOW() - make_interval(secs => $1::double precision) \
         RETURNING *",
    )
    .bind(older_than_secs as f64)
    .fetch_all(pool)
    .await
    .context("failed to reap stale claims")?;

    Ok(executions)
}

/// All non-terminal child executions of a parent.
pub async fn non_terminal_children(pool: &PgPool, parent_id: Uuid) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions \
         WHERE parent_execution_id = $1 \
           AND status IN ('pending', 'running', 'suspended')",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await
    .context("failed to list non-terminal children")?;

    Ok(executions)
}

/// Latest child execution spawned by a given sub-workflow node of a parent.
pub async fn find_child(
    pool: &PgPool,
    parent_id: Uuid,
    parent_node_id: &str,
) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions \
         WHERE parent_execution_id = $1 AND parent_node_id = $2 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(parent_id)
    .bind(parent_node_id)
    .fetch_optional(pool)
    .await
    .context("failed to find child execution")?;

    Ok(execution)
}

/// Non-terminal executions dispatched by a given schedule (overlap-policy
/// checks). Matches on the `schedule_id` the dispatcher records in the
/// trigger payload.
pub async fn non_terminal_for_schedule(
    pool: &PgPool,
    schedule_id: Uuid,
) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions \
         WHERE trigger_type = 'schedule' \
           AND trigger_payload ->> 'schedule_id' = $1 \
           AND status IN ('pending', 'running', 'suspended')",
    )
    .bind(schedule_id.to_string())
    .fetch_all(pool)
    .await
    .context("failed to list executions for schedule")?;

    Ok(executions)
}
