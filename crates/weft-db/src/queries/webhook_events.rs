//! Database query functions for the `webhook_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{WebhookEvent, WebhookEventStatus};

/// Record an inbound webhook request.
pub async fn insert_event(
    pool: &PgPool,
    webhook_id: Uuid,
    tenant_id: Uuid,
    status: WebhookEventStatus,
    payload: Option<&serde_json::Value>,
    headers: Option<&serde_json::Value>,
) -> Result<WebhookEvent> {
    let event = sqlx::query_as::<_, WebhookEvent>(
        "INSERT INTO webhook_events (webhook_id, tenant_id, status, payload, headers) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(webhook_id)
    .bind(tenant_id)
    .bind(status)
    .bind(payload)
    .bind(headers)
    .fetch_one(pool)
    .await
    .context("failed to insert webhook event")?;

    Ok(event)
}

/// Link an accepted event to the execution it started.
pub async fn set_execution(pool: &PgPool, event_id: Uuid, execution_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE webhook_events SET execution_id = $1 WHERE id = $2")
        .bind(execution_id)
        .bind(event_id)
        .execute(pool)
        .await
        .context("failed to link webhook event to execution")?;

    Ok(result.rows_affected())
}

/// List the most recent events of a webhook.
pub async fn list_for_webhook(
    pool: &PgPool,
    tenant_id: Uuid,
    webhook_id: Uuid,
    limit: i64,
) -> Result<Vec<WebhookEvent>> {
    let events = sqlx::query_as::<_, WebhookEvent>(
        "SELECT * FROM webhook_events \
         WHERE tenant_id = $1 AND webhook_id = $2 \
         ORDER BY received_at DESC \
         LIMIT $3",
    )
    .bind(tenant_id)
    .bind(webhook_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list webhook events")?;

    Ok(events)
}
