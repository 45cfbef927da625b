//! Downstream forwarding to worker pods.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The lowest request timeout ever applied downstream.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("agent returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("{0}")]
    Network(#[from] reqwest::Error),
}

/// Envelope forwarded to the worker's /invoke endpoint.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub query: String,
    pub input: Option<Value>,
    pub metadata: Option<Value>,
    pub correlation_id: String,
    pub tenant_id: String,
}

/// HTTP forwarder shared by the API and MCP paths.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// POST the request envelope to the worker and interpret the reply:
    /// JSON bodies pass through parsed, non-JSON bodies surface as text,
    /// status >= 400 classifies as an upstream error.
    pub async fn forward(
        &self,
        endpoint: &str,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<Value, ForwardError> {
        let url = format!("http://{}/invoke", normalize_endpoint(endpoint));
        let body = json!({
            "query": request.query,
            "input": request.input,
            "metadata": request.metadata,
            "correlationId": request.correlation_id,
            "tenantId": request.tenant_id,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout.max(MIN_REQUEST_TIMEOUT))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() >= 400 {
            return Err(ForwardError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Force absolute DNS resolution for cluster-internal endpoints: a
/// search-domain-sensitive host gets a trailing dot.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let Some((host, port)) = endpoint.split_once(':') else {
        return endpoint.to_string();
    };

    if host.contains(".svc.cluster.local") && !host.ends_with('.') {
        format!("{host}.:{port}")
    } else {
        endpoint.to_string()
    }
}

/// Reduce a worker reply to text for protocol surfaces that need a
/// string: unwrap a string `result`/`response`/`output` field, render a
/// non-string `result` as JSON, otherwise pass the whole body through.
pub fn unwrap_text(value: &Value) -> String {
    if let Some(object) = value.as_object() {
        if let Some(result) = object.get("result") {
            if let Some(text) = result.as_str() {
                return text.to_string();
            }
            return serde_json::to_string_pretty(result).unwrap_or_default();
        }
        for key in ["response", "output"] {
            if let Some(text) = object.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
        return serde_json::to_string(value).unwrap_or_default();
    }

    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Build the hash key for sticky selection.
pub fn sticky_key(tenant_id: &str, correlation_id: &str) -> String {
    format!("{tenant_id}:{correlation_id}")
}

/// Turn a header map into the matcher's view: first value per key.
pub fn header_map(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
