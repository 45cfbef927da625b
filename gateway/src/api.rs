//! Client-facing HTTP surface: /v1/invoke, /v1/agents, /v1/routes and
//! /healthz, with classified error envelopes.

use crate::circuit::{AcquireError, BreakerConfig, BreakerManager};
use crate::dispatch::{header_map, sticky_key, ForwardRequest, Forwarder, MIN_REQUEST_TIMEOUT};
use crate::metrics::GatewayMetrics;
use crate::selector::{select, SelectionStrategy};
use crate::table::{MatchRequest, RouteTable};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request body for POST /v1/invoke.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokeRequest {
    pub agent: String,
    pub intent: String,
    pub query: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub input: Option<Value>,
    pub metadata: Option<Value>,
}

/// Response envelope for POST /v1/invoke.
#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

/// Shared state for the API handlers.
pub struct ApiState {
    pub table: Arc<RouteTable>,
    pub breakers: BreakerManager,
    pub forwarder: Forwarder,
    pub metrics: Arc<GatewayMetrics>,
    request_timeout: Mutex<Duration>,
}

impl ApiState {
    pub fn new(
        table: Arc<RouteTable>,
        metrics: Arc<GatewayMetrics>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            table,
            breakers: BreakerManager::new(BreakerConfig::default(), metrics.clone()),
            forwarder: Forwarder::new(),
            metrics,
            request_timeout: Mutex::new(request_timeout),
        }
    }

    /// Re-read admission and timeout defaults from the loaded table.
    /// Existing pools keep their creation-time limits.
    pub fn apply_table_defaults(&self) {
        let Some(defaults) = self.table.defaults() else {
            return;
        };

        self.breakers.update_defaults(BreakerConfig {
            max_concurrent: defaults.max_concurrent,
            max_queue_size: defaults.max_queue_size,
            queue_timeout: Duration::from_millis(
                u64::try_from(defaults.queue_timeout_ms.max(0)).unwrap_or(30_000),
            ),
        });

        if defaults.request_timeout_ms > 0 {
            *self.request_timeout.lock() = Duration::from_millis(
                u64::try_from(defaults.request_timeout_ms).unwrap_or(300_000),
            );
        }
    }

    pub fn request_timeout(&self) -> Duration {
        (*self.request_timeout.lock()).max(MIN_REQUEST_TIMEOUT)
    }
}

/// Build the /v1 router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/invoke", post(handle_invoke))
        .route("/v1/agents", get(handle_list_agents))
        .route("/v1/routes", get(handle_list_routes))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

async fn handle_invoke(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    let request: InvokeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            state.metrics.record_request_error("", "", "invalid_request");
            state
                .metrics
                .record_request("", "", 400, start.elapsed().as_secs_f64());
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                "",
            );
        }
    };

    let match_result = state.table.match_request(&MatchRequest {
        agent: request.agent.clone(),
        intent: request.intent.clone(),
        tenant_id: request.tenant_id.clone(),
        headers: header_map(&headers),
    });

    let Some(match_result) = match_result else {
        state.metrics.record_route_no_match();
        let reject = state
            .table
            .defaults()
            .is_some_and(|d| d.reject_unmatched);
        let (status, error_type, message) = if reject {
            (StatusCode::BAD_REQUEST, "no_route_match", "no matching route found")
        } else {
            (StatusCode::NOT_FOUND, "no_agent", "no available agent for this request")
        };
        state.metrics.record_request_error("", "", error_type);
        state
            .metrics
            .record_request("", "", status.as_u16(), start.elapsed().as_secs_f64());
        return error_response(status, message, &request.correlation_id);
    };

    let route_name = match_result.rule_name.clone();
    state.metrics.record_route_match(&route_name);

    // Sticky selection whenever the request is attributable
    let strategy = if request.tenant_id.is_empty() && request.correlation_id.is_empty() {
        SelectionStrategy::WeightedRandom
    } else {
        SelectionStrategy::ConsistentHash
    };
    let hash_key = sticky_key(&request.tenant_id, &request.correlation_id);

    let Some(backend) = select(&match_result.backends, strategy, &hash_key).cloned() else {
        state
            .metrics
            .record_request_error("", &route_name, "no_backend");
        state
            .metrics
            .record_request("", &route_name, 503, start.elapsed().as_secs_f64());
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no backend available",
            &request.correlation_id,
        );
    };

    let agent_name = backend.agent_name.clone();

    // Admission: the permit is held across the forward and released on
    // every exit path when it drops.
    let breaker = state.breakers.get(&route_name);
    let permit = match breaker.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            let error_type = match e {
                AcquireError::QueueFull => "queue_full",
                AcquireError::QueueTimeout => "queue_timeout",
            };
            state
                .metrics
                .record_request_error(&agent_name, &route_name, error_type);
            state
                .metrics
                .record_request(&agent_name, &route_name, 503, start.elapsed().as_secs_f64());
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
                &request.correlation_id,
            );
        }
    };

    state
        .metrics
        .record_backend_forward(&agent_name, &backend.namespace);

    debug!(
        "Forwarding to {agent_name} via rule {route_name} (endpoint {})",
        backend.endpoint
    );

    let forwarded = state
        .forwarder
        .forward(
            &backend.endpoint,
            &ForwardRequest {
                query: request.query.clone(),
                input: request.input.clone(),
                metadata: request.metadata.clone(),
                correlation_id: request.correlation_id.clone(),
                tenant_id: request.tenant_id.clone(),
            },
            state.request_timeout(),
        )
        .await;
    drop(permit);

    match forwarded {
        Ok(result) => {
            state
                .metrics
                .record_request(&agent_name, &route_name, 200, start.elapsed().as_secs_f64());
            let latency_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            Json(InvokeResponse {
                success: true,
                result: Some(result),
                agent: Some(agent_name),
                correlation_id: (!request.correlation_id.is_empty())
                    .then(|| request.correlation_id.clone()),
                latency_ms: Some(latency_ms),
                ..Default::default()
            })
            .into_response()
        }
        Err(e) => {
            warn!("Worker {agent_name} failed: {e}");
            state
                .metrics
                .record_request_error(&agent_name, &route_name, "agent_error");
            state
                .metrics
                .record_request(&agent_name, &route_name, 502, start.elapsed().as_secs_f64());
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("agent error: {e}"),
                &request.correlation_id,
            )
        }
    }
}

async fn handle_list_agents(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({"agents": state.table.snapshot().ready_agents()}))
}

async fn handle_list_routes(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let routes = state.table.snapshot().route_names();
    Json(json!({"routes": routes, "count": routes.len()}))
}

async fn handle_healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn error_response(status: StatusCode, message: &str, correlation_id: &str) -> Response {
    let envelope = InvokeResponse {
        success: false,
        error: Some(message.to_string()),
        correlation_id: (!correlation_id.is_empty()).then(|| correlation_id.to_string()),
        ..Default::default()
    };
    (status, Json(envelope)).into_response()
}
