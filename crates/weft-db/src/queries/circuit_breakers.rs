//! Database query functions for the `circuit_breakers` table.
//!
//! Breaker state is shared by every execution flowing through the same
//! `(workflow_id, node_id)` pair, possibly on different workers, so all
//! writes go through a compare-and-set on the `version` column.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BreakerState, CircuitBreaker};

/// Fetch the breaker row for a workflow node, creating a closed one if it
/// does not exist yet.
pub async fn get_or_create(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Uuid,
    node_id: &str,
) -> Result<CircuitBreaker> {
    sqlx::query(
        "INSERT INTO circuit_breakers (tenant_id, workflow_id, node_id) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (workflow_id, node_id) DO NOTHING",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to initialise circuit breaker")?;

    let breaker = sqlx::query_as::<_, CircuitBreaker>(
        "SELECT * FROM circuit_breakers WHERE workflow_id = $1 AND node_id = $2",
    )
    .bind(workflow_id)
    .bind(node_id)
    .fetch_one(pool)
    .await
    .context("failed to fetch circuit breaker")?;

    Ok(breaker)
}

/// Compare-and-set the breaker state.
///
/// Applies only when the stored `version` still matches; returns the number
/// of rows affected (0 means another worker won the race and the caller
/// should re-read).
#[allow(clippy::too_many_arguments)]
pub async fn cas_update(
    pool: &PgPool,
    workflow_id: Uuid,
    node_id: &str,
    expected_version: i32,
    state: BreakerState,
    failure_count: i32,
    half_open_attempts: i32,
    opened_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE circuit_breakers \
         SET state = $1, failure_count = $2, half_open_attempts = $3, \
             opened_at = $4, version = version + 1, updated_at = NOW() \
         WHERE workflow_id = $5 AND node_id = $6 AND version = $7",
    )
    .bind(state)
    .bind(failure_count)
    .bind(half_open_attempts)
    .bind(opened_at)
    .bind(workflow_id)
    .bind(node_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to update circuit breaker")?;

    Ok(result.rows_affected())
}
