//! In-app notification endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use weft_db::queries::notifications as notification_db;

use super::{AppError, AppState, identity, tenant_id};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let user_id = match params.user_id {
        Some(user_id) => user_id,
        None => identity(&headers)?.user_id,
    };

    let notifications = notification_db::list_for_user(
        &state.pool,
        tenant,
        &user_id,
        params.limit.unwrap_or(100).clamp(1, 500),
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(notifications).into_response())
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let rows = notification_db::mark_read(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::not_found(format!("notification {id} not found")));
    }
    Ok(Json(json!({ "read": true })).into_response())
}
