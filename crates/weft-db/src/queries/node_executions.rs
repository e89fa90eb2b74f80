//! Database query functions for the `node_executions` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::NodeExecution;

/// Record that a node attempt started.
///
/// Upserts on `(execution_id, node_id, attempt)`: a crash-replayed attempt
/// that never completed is reset to `running` instead of violating the
/// uniqueness invariant.
pub async fn upsert_started(
    pool: &PgPool,
    execution_id: Uuid,
    node_id: &str,
    attempt: i32,
    input_snapshot: &serde_json::Value,
) -> Result<NodeExecution> {
    let row = sqlx::query_as::<_, NodeExecution>(
        "INSERT INTO node_executions (execution_id, node_id, attempt, status, input_snapshot, started_at) \
         VALUES ($1, $2, $3, 'running', $4, NOW()) \
         ON CONFLICT (execution_id, node_id, attempt) DO UPDATE \
         SET status = 'running', input_snapshot = EXCLUDED.input_snapshot, \
             output = NULL, error = NULL, started_at = NOW(), \
             completed_at = NULL, duration_ms = NULL \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(node_id)
    .bind(attempt)
    .bind(input_snapshot)
    .fetch_one(pool)
    .await
    .context("failed to record node execution start")?;

    Ok(row)
}

/// Mark a node attempt completed with its output.
///
/// `duration_ms` is derived from `started_at` in SQL so the two timestamps
/// stay consistent.
pub async fn mark_completed(pool: &PgPool, id: Uuid, output: &serde_json::Value) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_executions \
         SET status = 'completed', output = $1, completed_at = NOW(), \
             duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(output)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark node execution completed")?;

    Ok(result.rows_affected())
}

/// Mark a node attempt failed with an error message.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_executions \
         SET status = 'failed', error = $1, completed_at = NOW(), \
             duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark node execution failed")?;

    Ok(result.rows_affected())
}

/// Record a skipped node (untaken condition branch).
///
/// Idempotent: replays of the same traversal hit the conflict and keep the
/// first row.
pub async fn insert_skipped(pool: &PgPool, execution_id: Uuid, node_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO node_executions (execution_id, node_id, attempt, status, completed_at) \
         VALUES ($1, $2, 1, 'skipped', NOW()) \
         ON CONFLICT (execution_id, node_id, attempt) DO NOTHING",
    )
    .bind(execution_id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to record skipped node")?;

    Ok(())
}

/// List all node executions of an execution, in dispatch order.
pub async fn list_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<Vec<NodeExecution>> {
    let rows = sqlx::query_as::<_, NodeExecution>(
        "SELECT * FROM node_executions \
         WHERE execution_id = $1 \
         ORDER BY started_at ASC NULLS LAST, node_id ASC, attempt ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list node executions")?;

    Ok(rows)
}

/// The latest completed output per node of an execution.
///
/// This is the replay source when a suspended execution resumes: traversal
/// seeds these outputs and skips re-running the nodes.
pub async fn latest_completed_outputs(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<(String, serde_json::Value)>> {
    let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
        "SELECT DISTINCT ON (node_id) node_id, output \
         FROM node_executions \
         WHERE execution_id = $1 AND status = 'completed' AND output IS NOT NULL \
         ORDER BY node_id, attempt DESC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to load completed node outputs")?;

    Ok(rows)
}
