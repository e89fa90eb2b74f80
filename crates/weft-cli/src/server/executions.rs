//! Execution read and cancel endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use weft_db::models::ExecutionStatus;
use weft_db::queries::executions as execution_db;

use super::{AppError, AppState, actor, audit, tenant_id};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    let status = params
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<ExecutionStatus>()
                .map_err(|_| AppError::bad_request(format!("invalid status {raw:?}")))
        })
        .transpose()?;

    let executions = execution_db::list_executions(
        &state.pool,
        tenant,
        params.workflow_id,
        status,
        params.limit.unwrap_or(100).clamp(1, 500),
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(executions).into_response())
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let snapshot = state.engine.status(tenant, id).await?;
    Ok(Json(snapshot).into_response())
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled by user".to_owned());

    let execution = state.engine.cancel(tenant, id, &reason).await?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "execution.cancel",
        "execution",
        &id.to_string(),
    )
    .await;

    Ok(Json(execution).into_response())
}
