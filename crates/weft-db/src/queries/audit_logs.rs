//! Database query functions for the `audit_logs` table.
//!
//! Audit writes are best-effort at the call sites: callers log and continue
//! on failure rather than failing the mutation they record.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AuditLog;

/// Insert an audit entry.
pub async fn insert_audit(
    pool: &PgPool,
    tenant_id: Uuid,
    actor: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    detail: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (tenant_id, actor, action, entity_type, entity_id, detail) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(tenant_id)
    .bind(actor)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(detail)
    .execute(pool)
    .await
    .context("failed to insert audit log")?;

    Ok(())
}

/// List the most recent audit entries for a tenant.
pub async fn list_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
) -> Result<Vec<AuditLog>> {
    let rows = sqlx::query_as::<_, AuditLog>(
        "SELECT * FROM audit_logs \
         WHERE tenant_id = $1 \
         ORDER BY created_at DESC \
         LIMIT $2",
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list audit logs")?;

    Ok(rows)
}
