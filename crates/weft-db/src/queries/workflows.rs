//! Database query functions for the `workflows` and `workflow_versions`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowStatus, WorkflowVersion};

/// Fields for a new workflow row.
#[derive(Debug, Clone)]
pub struct NewWorkflow<'a> {
    pub tenant_id: Uuid,
    pub name: &'a str,
    pub status: WorkflowStatus,
    pub definition: &'a serde_json::Value,
}

/// Insert a new workflow at version 1 together with its immutable version
/// snapshot.
pub async fn insert_workflow(pool: &PgPool, new: &NewWorkflow<'_>) -> Result<Workflow> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (tenant_id, name, status, definition) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.name)
    .bind(new.status)
    .bind(new.definition)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert workflow")?;

    sqlx::query(
        "INSERT INTO workflow_versions (tenant_id, workflow_id, version, definition) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(new.tenant_id)
    .bind(workflow.id)
    .bind(workflow.version)
    .bind(new.definition)
    .execute(&mut *tx)
    .await
    .context("failed to insert workflow version")?;

    tx.commit().await.context("failed to commit workflow insert")?;

    Ok(workflow)
}

/// Whether an error chain bottoms out in a Postgres unique violation.
///
/// Used by the API layer to map duplicate workflow names to 409 Conflict.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Fetch a single workflow by ID, scoped to a tenant.
pub async fn get_workflow(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List all workflows for a tenant, newest first.
pub async fn list_workflows(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE tenant_id = $1 ORDER BY created_at DESC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflows")?;

    Ok(workflows)
}

/// Replace a workflow's definition, bumping the version counter and writing
/// a new immutable version snapshot.
///
/// Optimistic-locked on the current version: returns `None` when the stored
/// version no longer matches `expected_version` (concurrent edit).
pub async fn update_definition(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    definition: &serde_json::Value,
    expected_version: i32,
) -> Result<Option<Workflow>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let workflow = sqlx::query_as::<_, Workflow>(
        "UPDATE workflows \
         SET definition = $1, version = version + 1, updated_at = NOW() \
         WHERE tenant_id = $2 AND id = $3 AND version = $4 \
         RETURNING *",
    )
    .bind(definition)
    .bind(tenant_id)
    .bind(id)
    .bind(expected_version)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to update workflow definition")?;

    let Some(workflow) = workflow else {
        return Ok(None);
    };

    sqlx::query(
        "INSERT INTO workflow_versions (tenant_id, workflow_id, version, definition) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(tenant_id)
    .bind(id)
    .bind(workflow.version)
    .bind(definition)
    .execute(&mut *tx)
    .await
    .context("failed to insert workflow version")?;

    tx.commit().await.context("failed to commit workflow update")?;

    Ok(Some(workflow))
}

/// Update the status of a workflow. Returns the updated row.
pub async fn set_status(
    pool: &PgPool,
    tenant_id: Uuid,
    id: Uuid,
    status: WorkflowStatus,
) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "UPDATE workflows SET status = $1, updated_at = NOW() \
         WHERE tenant_id = $2 AND id = $3 \
         RETURNING *",
    )
    .bind(status)
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to set workflow status")?;

    Ok(workflow)
}

/// Delete a workflow. Schedules, webhooks and version snapshots cascade;
/// historical executions are kept.
pub async fn delete_workflow(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workflows WHERE tenant_id = $1 AND id = $2")
        .bind(tenant_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete workflow")?;

    Ok(result.rows_affected())
}

/// Fetch one immutable version snapshot of a workflow.
pub async fn get_version(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Uuid,
    version: i32,
) -> Result<Option<WorkflowVersion>> {
    let row = sqlx::query_as::<_, WorkflowVersion>(
        "SELECT * FROM workflow_versions \
         WHERE tenant_id = $1 AND workflow_id = $2 AND version = $3",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .bind(version)
    .fetch_optional(pool)
    .await
    .context("failed to fetch workflow version")?;

    Ok(row)
}

/// List all version snapshots of a workflow, newest first.
pub async fn list_versions(
    pool: &PgPool,
    tenant_id: Uuid,
    workflow_id: Uuid,
) -> Result<Vec<WorkflowVersion>> {
    let rows = sqlx::query_as::<_, WorkflowVersion>(
        "SELECT * FROM workflow_versions \
         WHERE tenant_id = $1 AND workflow_id = $2 \
         ORDER BY version DESC",
    )
    .bind(tenant_id)
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow versions")?;

    Ok(rows)
}
