//! Human-task endpoints: list/get, completion actions, manual escalation,
//! and escalation history.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use weft_core::humantask::TaskAction;
use weft_db::models::TaskStatus;
use weft_db::queries::human_tasks as task_db;

use super::{AppError, AppState, identity, tenant_id};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompleteRequest {
    /// Response payload recorded on the task and handed to the resumed
    /// execution.
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl CompleteRequest {
    fn payload(self) -> Option<Value> {
        match (self.data, self.comment) {
            (Some(data), None) => Some(data),
            (data, Some(comment)) => {
                let mut map = serde_json::Map::new();
                if let Some(data) = data {
                    map.insert("data".to_owned(), data);
                }
                map.insert("comment".to_owned(), Value::String(comment));
                Some(Value::Object(map))
            }
            (None, None) => None,
        }
    }
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
            raw.parse::<TaskStatus>()
                .map_err(|_| AppError::bad_request(format!("invalid task status {raw:?}")))
        })
        .transpose()?;

    let tasks = task_db::list_tasks(
        &state.pool,
        tenant,
        status,
        params.assignee.as_deref(),
        params.limit.unwrap_or(100).clamp(1, 500),
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(tasks).into_response())
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let task = state.engine.tasks().get(tenant, id).await?;
    Ok(Json(task).into_response())
}

async fn complete(
    state: AppState,
    headers: HeaderMap,
    id: Uuid,
    action: TaskAction,
    body: Option<Json<CompleteRequest>>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let caller = identity(&headers)?;
    let payload = body.map(|Json(b)| b).unwrap_or_default().payload();

    let task = state
        .engine
        .tasks()
        .complete(tenant, id, action, &caller.user_id, &caller.roles, payload)
        .await?;

    Ok(Json(task).into_response())
}

pub async fn approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> Result<axum::response::Response, AppError> {
    complete(state, headers, id, TaskAction::Approve, body).await
}

pub async fn reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> Result<axum::response::Response, AppError> {
    complete(state, headers, id, TaskAction::Reject, body).await
}

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> Result<axum::response::Response, AppError> {
    complete(state, headers, id, TaskAction::Submit, body).await
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let caller = identity(&headers)?;
    let task = state
        .engine
        .tasks()
        .cancel(tenant, id, &caller.user_id)
        .await?;
    Ok(Json(task).into_response())
}

pub async fn escalate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let task = state.engine.tasks().escalate_manual(tenant, id).await?;
    Ok(Json(task).into_response())
}

pub async fn escalations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let history = state.engine.tasks().escalations(tenant, id).await?;
    Ok(Json(history).into_response())
}
