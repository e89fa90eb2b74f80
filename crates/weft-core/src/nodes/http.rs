//! The HTTP action executor.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::EngineError;

use super::{ExecInput, NodeExecutor};

/// Executes `action:http` nodes with a shared `reqwest` client.
///
/// Config: `{url, method?, headers?, body?, timeout_seconds?}`. A non-2xx
/// response is a [`EngineError::Downstream`] failure carrying the status
/// code, so retry and try/catch operators can recover it.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn kind(&self) -> &'static str {
        "action:http"
    }

    async fn execute(&self, input: ExecInput<'_>) -> Result<Value, EngineError> {
        let url = input
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("http node requires a url".to_owned()))?;

        let method_str = input
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method: reqwest::Method = method_str
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid http method {method_str:?}")))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = input.config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }

        if let Some(body) = input.config.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Downstream(format!("http request to {url} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Downstream(format!("failed to read response body: {e}")))?;

        // Parse the body as JSON when possible, fall back to the raw text.
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            return Err(EngineError::Downstream(format!(
                "{url} returned status {}",
                status.as_u16()
            )));
        }

        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}
