//! The webhook ingester: authentication, filter evaluation, event
//! recording, and hand-off to the engine.

pub mod filters;

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use weft_db::models::{TriggerType, Webhook, WebhookAuthType, WebhookEventStatus};
use weft_db::queries::{webhook_events, webhooks as webhook_db};

use crate::engine::Engine;
use crate::error::EngineError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Headers never recorded on webhook events.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", SIGNATURE_HEADER];

/// Outcome of an accepted ingest call.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Payload passed the filters; an execution was started.
    Accepted { execution_id: Uuid },
    /// Payload was rejected by the filters; recorded, no execution.
    Filtered,
}

/// Compute the `sha256=<hex>` signature of a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature header against the raw body.
///
/// Uses the `hmac` crate's `verify_slice`, which compares in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Constant-time equality for API key comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Ingest one inbound webhook request.
///
/// `headers` must carry lowercase header names. Errors map to the data
/// plane statuses: `NotFound` 404 (missing / disabled / mismatched),
/// `Unauthorized` 401, `Validation` 400.
pub async fn ingest(
    pool: &PgPool,
    engine: &Engine,
    workflow_id: Uuid,
    webhook_id: Uuid,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<IngestOutcome, EngineError> {
    let webhook = webhook_db::get_for_ingest(pool, workflow_id, webhook_id)
        .await
        .map_err(EngineError::internal)?
        .filter(|w| w.enabled)
        .ok_or_else(|| EngineError::NotFound("webhook not found".to_owned()))?;

    authenticate(&webhook, headers, body)?;

    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| EngineError::Validation(format!("request body is not valid JSON: {e}")))?;

    let recorded_headers = sanitize_headers(&webhook, headers);

    let filters = webhook_db::list_filters(pool, webhook.id)
        .await
        .map_err(EngineError::internal)?;

    if !filters::evaluate_filters(&filters, &payload) {
        webhook_events::insert_event(
            pool,
            webhook.id,
            webhook.tenant_id,
            WebhookEventStatus::Filtered,
            Some(&payload),
            Some(&recorded_headers),
        )
        .await
        .map_err(EngineError::internal)?;

        tracing::info!(webhook_id = %webhook.id, "webhook payload filtered");
        return Ok(IngestOutcome::Filtered);
    }

    let event = webhook_events::insert_event(
        pool,
        webhook.id,
        webhook.tenant_id,
        WebhookEventStatus::Accepted,
        Some(&payload),
        Some(&recorded_headers),
    )
    .await
    .map_err(EngineError::internal)?;

    let execution = engine
        .start(
            webhook.tenant_id,
            webhook.workflow_id,
            None,
            TriggerType::Webhook,
            payload,
            None,
        )
        .await?;

    webhook_events::set_execution(pool, event.id, execution.id)
        .await
        .map_err(EngineError::internal)?;

    tracing::info!(
        webhook_id = %webhook.id,
        execution_id = %execution.id,
        "webhook accepted, execution started"
    );

    Ok(IngestOutcome::Accepted {
        execution_id: execution.id,
    })
}

fn authenticate(
    webhook: &Webhook,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<(), EngineError> {
    match webhook.auth_type {
        WebhookAuthType::None => Ok(()),
        WebhookAuthType::Signature => {
            let secret = webhook.secret.as_deref().ok_or_else(|| {
                EngineError::Internal(format!("webhook {} has no secret", webhook.id))
            })?;
            let header = headers
                .get(SIGNATURE_HEADER)
                .ok_or_else(|| EngineError::Unauthorized("missing signature header".to_owned()))?;
            if verify_signature(secret, body, header) {
                Ok(())
            } else {
                Err(EngineError::Unauthorized("invalid signature".to_owned()))
            }
        }
        WebhookAuthType::ApiKey => {
            let secret = webhook.secret.as_deref().ok_or_else(|| {
                EngineError::Internal(format!("webhook {} has no secret", webhook.id))
            })?;
            let header_name = webhook.api_key_header.to_ascii_lowercase();
            let provided = headers
                .get(&header_name)
                .ok_or_else(|| EngineError::Unauthorized("missing api key header".to_owned()))?;
            if constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(EngineError::Unauthorized("invalid api key".to_owned()))
            }
        }
    }
}

/// Drop credentials from the headers recorded on the event.
fn sanitize_headers(webhook: &Webhook, headers: &HashMap<String, String>) -> Value {
    let api_key_header = webhook.api_key_header.to_ascii_lowercase();
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if SENSITIVE_HEADERS.contains(&name.as_str()) || *name == api_key_header {
            continue;
        }
        map.insert(name.clone(), json!(value));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let body = br#"{"event":"x"}"#;
        let signature = sign("s3cr3t", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("s3cr3t", body, &signature));
    }

    #[test]
    fn bit_flip_in_body_fails() {
        let signature = sign("s3cr3t", br#"{"event":"x"}"#);
        assert!(!verify_signature("s3cr3t", br#"{"event":"y"}"#, &signature));
    }

    #[test]
    fn bit_flip_in_signature_fails() {
        let body = br#"{"event":"x"}"#;
        let mut signature = sign("s3cr3t", body);
        let last = signature.pop().unwrap();
        signature.push(if last == '0' { '1' } else { '0' });
        assert!(!verify_signature("s3cr3t", body, &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"event":"x"}"#;
        let signature = sign("s3cr3t", body);
        assert!(!verify_signature("different", body, &signature));
    }

    #[test]
    fn malformed_signature_header_fails() {
        let body = br#"{"event":"x"}"#;
        assert!(!verify_signature("s3cr3t", body, "sha256=deadbeef"));
        assert!(!verify_signature("s3cr3t", body, "md5=abc"));
        assert!(!verify_signature("s3cr3t", body, "sha256=not-hex!"));
        assert!(!verify_signature("s3cr3t", body, ""));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
