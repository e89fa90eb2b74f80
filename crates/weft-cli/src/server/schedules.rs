//! Schedule CRUD and the cron parse endpoint.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use weft_core::schedule::{parse_cron, parse_timezone};
use weft_db::models::OverlapPolicy;
use weft_db::queries::schedules as schedule_db;
use weft_db::queries::schedules::NewSchedule;
use weft_db::queries::workflows as workflow_db;

use super::{AppError, AppState, actor, audit, tenant_id};

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub overlap_policy: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub overlap_policy: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ParseCronRequest {
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

fn default_enabled() -> bool {
    true
}

fn parse_policy(raw: Option<&str>) -> Result<OverlapPolicy, AppError> {
    match raw {
        None => Ok(OverlapPolicy::Skip),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::bad_request(format!("invalid overlap policy {raw:?}"))),
    }
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<CreateScheduleRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    workflow_db::get_workflow(&state.pool, tenant, workflow_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {workflow_id} not found")))?;

    let spec = parse_cron(&body.cron_expression)?;
    let tz = parse_timezone(&body.timezone)?;
    let overlap_policy = parse_policy(body.overlap_policy.as_deref())?;

    let next_run_at = if body.enabled {
        spec.next_after(tz, Utc::now())
    } else {
        None
    };

    let schedule = schedule_db::insert_schedule(
        &state.pool,
        &NewSchedule {
            tenant_id: tenant,
            workflow_id,
            cron_expression: &spec.normalized,
            timezone: &body.timezone,
            overlap_policy,
            enabled: body.enabled,
            next_run_at,
        },
    )
    .await
    .map_err(AppError::internal)?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "schedule.create",
        "schedule",
        &schedule.id.to_string(),
    )
    .await;

    Ok((StatusCode::CREATED, Json(schedule)).into_response())
}

pub async fn list_for_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let schedules = schedule_db::list_for_workflow(&state.pool, tenant, workflow_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(schedules).into_response())
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let schedule = schedule_db::get_schedule(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("schedule {id} not found")))?;
    Ok(Json(schedule).into_response())
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;

    let existing = schedule_db::get_schedule(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("schedule {id} not found")))?;

    let cron_expression = body
        .cron_expression
        .unwrap_or_else(|| existing.cron_expression.clone());
    let timezone = body.timezone.unwrap_or_else(|| existing.timezone.clone());
    let overlap_policy = match body.overlap_policy.as_deref() {
        Some(raw) => parse_policy(Some(raw))?,
        None => existing.overlap_policy,
    };
    let enabled = body.enabled.unwrap_or(existing.enabled);

    let spec = parse_cron(&cron_expression)?;
    let tz = parse_timezone(&timezone)?;
    let next_run_at = if enabled {
        spec.next_after(tz, Utc::now())
    } else {
        None
    };

    let schedule = schedule_db::update_schedule(
        &state.pool,
        tenant,
        id,
        &spec.normalized,
        &timezone,
        overlap_policy,
        enabled,
        next_run_at,
    )
    .await
    .map_err(AppError::internal)?
    .ok_or_else(|| AppError::not_found(format!("schedule {id} not found")))?;

    audit(
        &state,
        tenant,
        &actor(&headers),
        "schedule.update",
        "schedule",
        &id.to_string(),
    )
    .await;

    Ok(Json(schedule).into_response())
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tenant = tenant_id(&headers)?;
    let rows = schedule_db::delete_schedule(&state.pool, tenant, id)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::not_found(format!("schedule {id} not found")));
    }

    audit(
        &state,
        tenant,
        &actor(&headers),
        "schedule.delete",
        "schedule",
        &id.to_string(),
    )
    .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn parse(
    Json(body): Json<ParseCronRequest>,
) -> Result<axum::response::Response, AppError> {
    let spec = parse_cron(&body.expression)?;
    let tz = parse_timezone(&body.timezone)?;
    let next_runs = spec.upcoming(tz, Utc::now(), 5);

    Ok(Json(json!({
        "normalized": spec.normalized,
        "timezone": body.timezone,
        "next_runs": next_runs,
    }))
    .into_response())
}
