//! The public webhook endpoint (data plane).

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use weft_core::webhook::{IngestOutcome, ingest};

use super::{AppError, AppState};

/// `POST /webhooks/{workflow_id}/{webhook_id}`.
///
/// 202 when accepted (execution started), 200 when the payload was
/// filtered, 401 on auth failure, 404 when missing or disabled, 400 on a
/// malformed body.
pub async fn receive(
    State(state): State<AppState>,
    Path((workflow_id, webhook_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    // Header names lowercase, values lossy; the ingester treats them as an
    // opaque map.
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_owned()))
        })
        .collect();

    let outcome = ingest(
        &state.pool,
        &state.engine,
        workflow_id,
        webhook_id,
        &header_map,
        &body,
    )
    .await?;

    match outcome {
        IngestOutcome::Accepted { execution_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "execution_id": execution_id })),
        )
            .into_response()),
        IngestOutcome::Filtered => {
            Ok((StatusCode::OK, Json(json!({ "status": "filtered" }))).into_response())
        }
    }
}
