//! Webhook CRUD, filter sub-resources, and event history.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use weft_core::webhook::filters::evaluate_filters;
use weft_db::models::{FilterOperator, WebhookAuthType};
use weft_db::queries::webhooks as webhook_db;
use weft_db::queries::webhooks::{NewWebhook, NewWebhookFilter};
use weft_db::queries::{webhook_events, workflows as workflow_db};

use super::{AppError, AppState, actor, audit, tenant_id};

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub node_id: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWebhookRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFilterRequest {
    pub field_path: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub logic_group: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub position: i32,
}

#[derive(Debug, Deserialize)]
pub struct TestFiltersRequest {
    pub payload: Value,
}

fn default_enabled() -> bool {
    true
}

fn parse_auth_type(raw: Option<&str>) -> Result<WebhookAuthType, AppError> {
    match raw {
        None => Ok(WebhookAuthType::None),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::bad_request(format!("invalid auth type {raw:?}"))),
    }
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    workflow_db::get_workflow(&state.pool, tenant, workflow_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {workflow_id} not found")))?;

    let auth_type = parse_auth_type(body.auth_type.as_deref())?;
    if matches!(
        auth_type,
        WebhookAuthType::Signature | WebhookAuthType::ApiKey
    ) && body.secret.as_deref().map(str::is_empty).unwrap_or(true)
    {
        return Err(AppError::bad_request(format!(
            "auth type {auth_type} requires a secret"
        )));
    }

    let path = body
        .path
        .unwrap_or_else(|| format!("{workflow_id}/{}", body.node_id));

    let webhook = webhook_db::insert_webhook(
        &state.pool,
        &NewWebhook {
            tenant_id: tenant,
            workflow_id,
            node_id: &body.node_id,
            path: &path,
            auth_type,
            secret: body.secret.as_deref(),
            api_key_header: body.api_key_header.as_deref().unwrap_or("X-API-Key"),
            enabled: body.enabled,
        },
    )
    .await
    .map_err(AppError::internal)?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "webhook.create",
        "webhook",
        &webhook.id.to_string(),
    )
    .await;

    Ok((StatusCode::CREATED, Json(webhook)).into_response())
}

pub async fn list_for_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let webhooks = webhook_db::list_for_workflow(&state.pool, tenant, workflow_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(webhooks).into_response())
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let webhook = webhook_db::get_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;
    Ok(Json(webhook).into_response())
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWebhookRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    let existing = webhook_db::get_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;

    let auth_type = match body.auth_type.as_deref() {
        Some(raw) => parse_auth_type(Some(raw))?,
        None => existing.auth_type,
    };
    let secret = body.secret.or(existing.secret);
    if matches!(
        auth_type,
        WebhookAuthType::Signature | WebhookAuthType::ApiKey
    ) && secret.as_deref().map(str::is_empty).unwrap_or(true)
    {
        return Err(AppError::bad_request(format!(
            "auth type {auth_type} requires a secret"
        )));
    }

    let webhook = webhook_db::update_webhook(
        &state.pool,
        tenant,
        id,
        body.path.as_deref().unwrap_or(&existing.path),
        auth_type,
        secret.as_deref(),
        body.api_key_header
            .as_deref()
            .unwrap_or(&existing.api_key_header),
        body.enabled.unwrap_or(existing.enabled),
    )
    .await
    .map_err(AppError::internal)?
    .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "webhook.update",
        "webhook",
        &id.to_string(),
    )
    .await;

    Ok(Json(webhook).into_response())
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let rows = webhook_db::delete_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::not_found(format!("webhook {id} not found")));
    }

    audit(
        &state,
        tenant,
        &actor(&headers),
        "webhook.delete",
        "webhook",
        &id.to_string(),
    )
    .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn add_filter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateFilterRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    webhook_db::get_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;

    let operator: FilterOperator = body
        .operator
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid filter operator {:?}", body.operator)))?;

    let filter = webhook_db::insert_filter(
        &state.pool,
        &NewWebhookFilter {
            webhook_id: id,
            field_path: &body.field_path,
            operator,
            value: body.value.as_deref(),
            logic_group: body.logic_group,
            enabled: body.enabled,
            position: body.position,
        },
    )
    .await
    .map_err(AppError::internal)?;

    Ok((StatusCode::CREATED, Json(filter)).into_response())
}

pub async fn list_filters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    webhook_db::get_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;

    let filters = webhook_db::list_filters(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(filters).into_response())
}

pub async fn remove_filter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    // Filters carry no tenant column; reachability is through the webhook,
    // so the tenant header is still required for the audit trail.
    let tenant = tenant_id(&headers)?;

    let rows = webhook_db::delete_filter(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::not_found(format!("filter {id} not found")));
    }

    audit(
        &state,
        tenant,
        &actor(&headers),
        "webhook.filter.delete",
        "webhook_filter",
        &id.to_string(),
    )
    .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Evaluate a webhook's stored filters against a sample payload.
pub async fn test_filters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<TestFiltersRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    webhook_db::get_webhook(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("webhook {id} not found")))?;

    let filters = webhook_db::list_filters(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    let passes = evaluate_filters(&filters, &body.payload);

    Ok(Json(json!({ "passes": passes, "filters": filters.len() })).into_response())
}

pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let events = webhook_events::list_for_webhook(&state.pool, tenant, id, 100)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(events).into_response())
}
