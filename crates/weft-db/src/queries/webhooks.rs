//! Database query functions for the `webhooks` and `webhook_filters`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{FilterOperator, Webhook, WebhookAuthType, WebhookFilter};

/// Fields for a new webhook row.
#[derive(Debug, Clone)]
pub struct NewWebhook<'a> {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: &'a str,
    pub path: &'a str,
    pub auth_type: WebhookAuthType,
    pub secret: Option<&'a str>,
    pub api_key_header: &'a str,
    pub enabled: bool,
}

/// Insert a new webhook row.
pub async fn insert_webhook(pool: &PgPool, new: &NewWebhook<'_>) -> Result<Webhook> {
    let webhook = sqlx::query_as::<_, Webhook>(
        "INSERT INTO webhooks \
         (tenant_id, workflow_id, node_id, path, auth_type, secret, api_key_header, enabled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.workflow_id)
    .bind(new.node_id)
    .bind(new.path)
    .bind(new.auth_type)
    .bind(new.secret)
    .bind(new.api_key_header)
    .bind(new.enabled)
    .fetch_one(pool)
    .await
    .context("failed to insert webhook")?;

    Ok(webhook)
}

/// Fetch a single webhook by ID, scoped to a tenant.
pub async fn get_webhook(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<Webhook>> {
    let webhook = sqlx::query_as::<_, Webhook>(
        "SELECT * FROM webhooks WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch webhook")?;

    Ok(webhook)
}

/// Fetch a webhook by its public ingest coordinates, tenant-agnostic.
///
/// The ingester validates the workflow binding and enablement itself so it
/// can answer 404 uniformly for "missing", "disabled" and "mismatched".
pub async fn get_for_ingest(
    pool: &PgPool,
    workflow_id: Uuid,
    webhook_id: Uuid,
) -> Result<Option<Webhook>> {
    let webhook = sqlx::query_as::<_, Webhook>(
        "SELECT * FROM webhooks WHERE id = $1 AND workflow_id = $2",
    )
    .bind(webhook_id)
    .bind(workflow_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch webhook for ingest")?;

    Ok(webhook)
}

/// List all webhooks of a workflow.
pub async fn list_for_workflow(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Uuid,
) -> Result<Vec<Webhook>> {
    let webhooks = sqlx::query_as::<_, Webhook>(
        "SELECT * FROM webhooks \
         WHERE tenant_id = $1 AND workflow_id = $2 \
         ORDER BY created_at ASC",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list webhooks for workflow")?;

    Ok(webhooks)
}

/// Replace the mutable fields of a webhook.
#[allow(clippy::too_many_arguments)]
pub async fn update_webhook(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    path: &str,
    auth_type: WebhookAuthType,
    secret: Option<&str>,
    api_key_header: &str,
    enabled: bool,
) -> Result<Option<Webhook>> {
    let webhook = sqlx::query_as::<_, Webhook>(
        "UPDATE webhooks \
         SET path = $1, auth_type = $2, secret = $3, api_key_header = $4, enabled = $5 \
         WHERE tenant_id = $6 AND id = $7 \
         RETURNING *",
    )
    .bind(path)
    .bind(auth_type)
    .bind(secret)
    .bind(api_key_header)
    .bind(enabled)
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to update webhook")?;

    Ok(webhook)
}

/// Delete a webhook (filters cascade).
pub async fn delete_webhook(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM webhooks WHERE tenant_id = $1 AND id = $2")
        .bind(tenant_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete webhook")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Filters
// -----------------------------------------------------------------------

/// Fields for a new webhook filter row.
#[derive(Debug, Clone)]
pub struct NewWebhookFilter<'a> {
    pub webhook_id: Uuid,
    pub field_path: &'a str,
    pub operator: FilterOperator,
    pub value: Option<&'a str>,
    pub logic_group: i32,
    pub enabled: bool,
    pub position: i32,
}

/// Insert a filter predicate for a webhook.
pub async fn insert_filter(pool: &PgPool, new: &NewWebhookFilter<'_>) -> Result<WebhookFilter> {
    let filter = sqlx::query_as::<_, WebhookFilter>(
        "INSERT INTO webhook_filters \
         (webhook_id, field_path, operator, value, logic_group, enabled, position) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.webhook_id)
    .bind(new.field_path)
    .bind(new.operator)
    .bind(new.value)
    .bind(new.logic_group)
    .bind(new.enabled)
    .bind(new.position)
    .fetch_one(pool)
    .await
    .context("failed to insert webhook filter")?;

    Ok(filter)
}

/// List a webhook's filters in evaluation order (group, then position).
pub async fn list_filters(pool: &PgPool, webhook_id: Uuid) -> Result<Vec<WebhookFilter>> {
    let filters = sqlx::query_as::<_, WebhookFilter>(
        "SELECT * FROM webhook_filters \
         WHERE webhook_id = $1 \
         ORDER BY logic_group ASC, position ASC",
    )
    .bind(webhook_id)
    .fetch_all(pool)
    .await
    .context("failed to list webhook filters")?;

    Ok(filters)
}

/// Delete a filter by ID.
pub async fn delete_filter(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM webhook_filters WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete webhook filter")?;

    Ok(result.rows_affected())
}
