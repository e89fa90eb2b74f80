//! Database query functions for the `notifications` table (in-app sink).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Notification;

/// Insert an in-app notification for one recipient.
pub async fn insert_notification(
    pool: &PgPool,
    tenant_id: Uuid,
    user_id: &str,
    event: &str,
    title: &str,
    body: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<Notification> {
    let notification = sqlx::query_as::<_, Notification>(
        "INSERT INTO notifications (tenant_id, user_id, event, title, body, payload) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(event)
    .bind(title)
    .bind(body)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to insert notification")?;

    Ok(notification)
}

/// List a user's notifications, newest first.
pub async fn list_for_user(
    pool: &PgPool,
    tenant_id: Uuid,
    user_id: &str,
    limit: i64,
) -> Result<Vec<Notification>> {
    let notifications = sqlx::query_as::<_, Notification>(
        "SELECT * FROM notifications \
         WHERE tenant_id = $1 AND user_id = $2 \
         ORDER BY created_at DESC \
         LIMIT $3",
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list notifications")?;

    Ok(notifications)
}

/// Mark a notification read.
pub async fn mark_read(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE notifications SET read = TRUE WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark notification read")?;

    Ok(result.rows_affected())
}
