//! Workflow CRUD, validation, versioning, and the manual execute endpoint.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use weft_core::graph::WorkflowDefinition;
use weft_db::models::{TriggerType, WorkflowStatus};
use weft_db::queries::workflows as workflow_db;
use weft_db::queries::workflows::NewWorkflow;

use super::{AppError, AppState, actor, audit, tenant_id};

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    pub definition: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkflowRequest {
    #[serde(default)]
    pub definition: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: Value,
}

/// Parse and validate a definition body; hard validation errors reject the
/// request, warnings are allowed through.
fn checked_definition(value: &Value) -> Result<WorkflowDefinition, AppError> {
    let definition = WorkflowDefinition::from_value(value)
        .map_err(|e| AppError::bad_request(format!("malformed definition: {e}")))?;
    let report = definition.validate();
    if !report.is_valid() {
        return Err(AppError::bad_request(format!(
            "invalid definition: {}",
            report.errors.join("; ")
        )));
    }
    Ok(definition)
}

fn parse_status(raw: &str) -> Result<WorkflowStatus, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid workflow status {raw:?}")))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkflowRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    checked_definition(&body.definition)?;

    let status = match &body.status {
        Some(raw) => parse_status(raw)?,
        None => WorkflowStatus::Draft,
    };

    let workflow = workflow_db::insert_workflow(
        &state.pool,
        &NewWorkflow {
            tenant_id: tenant,
            name: &body.name,
            status,
            definition: &body.definition,
        },
    )
    .await
    .map_err(|e| {
        if workflow_db::is_unique_violation(&e) {
            AppError::conflict(format!("workflow name {:?} already exists", body.name))
        } else {
            AppError::internal(e)
        }
    })?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "workflow.create",
        "workflow",
        &workflow.id.to_string(),
    )
    .await;

    Ok((StatusCode::CREATED, Json(workflow)).into_response())
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let workflows = workflow_db::list_workflows(&state.pool, tenant)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(workflows).into_response())
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let workflow = workflow_db::get_workflow(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;
    Ok(Json(workflow).into_response())
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWorkflowRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    if body.definition.is_none() && body.status.is_none() {
        return Err(AppError::bad_request(
            "update requires a definition or a status",
        ));
    }

    let mut workflow = workflow_db::get_workflow(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    if let Some(definition) = &body.definition {
        checked_definition(definition)?;
        workflow = workflow_db::update_definition(
            &state.pool,
            tenant,
            id,
            definition,
            workflow.version,
        )
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::conflict(format!("workflow {id} was modified concurrently"))
        })?;
    }

    if let Some(raw) = &body.status {
        let status = parse_status(raw)?;
        workflow = workflow_db::set_status(&state.pool, tenant, id, status)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;
    }

    audit(
        &state,
        tenant,
        &actor(&headers),
        "workflow.update",
        "workflow",
        &id.to_string(),
    )
    .await;

    Ok(Json(workflow).into_response())
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let rows = workflow_db::delete_workflow(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::not_found(format!("workflow {id} not found")));
    }

    audit(
        &state,
        tenant,
        &actor(&headers),
        "workflow.delete",
        "workflow",
        &id.to_string(),
    )
    .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let workflow = workflow_db::get_workflow(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    let report = match WorkflowDefinition::from_value(&workflow.definition) {
        Ok(definition) => definition.validate(),
        Err(e) => {
            return Ok(Json(json!({
                "valid": false,
                "errors": [format!("malformed definition: {e}")],
                "warnings": [],
            }))
            .into_response());
        }
    };

    Ok(Json(json!({
        "valid": report.is_valid(),
        "errors": report.errors,
        "warnings": report.warnings,
    }))
    .into_response())
}

pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<ExecuteRequest>>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let input = body.map(|Json(b)| b.input).unwrap_or(Value::Null);

    let execution = state
        .engine
        .start(tenant, id, None, TriggerType::Manual, input, None)
        .await?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "workflow.execute",
        "execution",
        &execution.id.to_string(),
    )
    .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "execution_id": execution.id,
            "status": execution.status,
        })),
    )
        .into_response())
}

pub async fn versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let versions = workflow_db::list_versions(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(versions).into_response())
}

/// Restore an old version: writes a new version whose definition equals the
/// restored one.
pub async fn restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, version)): Path<(Uuid, i32)>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    let snapshot = workflow_db::get_version(&state.pool, tenant, id, version)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::not_found(format!("workflow {id} has no version {version}"))
        })?;

    let current = workflow_db::get_workflow(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    let workflow = workflow_db::update_definition(
        &state.pool,
        tenant,
        id,
        &snapshot.definition,
        current.version,
    )
    .await
    .map_err(AppError::internal)?
    .ok_or_else(|| AppError::conflict(format!("workflow {id} was modified concurrently")))?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "workflow.restore",
        "workflow",
        &id.to_string(),
    )
    .await;

    Ok(Json(workflow).into_response())
}
