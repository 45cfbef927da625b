//! End-to-end dispatch tests: a real route table, the /v1 router and a
//! local stand-in worker.

use agentmesh_gateway::{api, ApiState, GatewayMetrics, RouteTable};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Clone)]
struct WorkerBehavior {
    response: Value,
    status: StatusCode,
    delay: Duration,
}

async fn worker_invoke(
    State(behavior): State<WorkerBehavior>,
    Json(_body): Json<Value>,
) -> impl IntoResponse {
    tokio::time::sleep(behavior.delay).await;
    (behavior.status, Json(behavior.response.clone()))
}

/// Spawn a local worker answering POST /invoke; returns its host:port.
async fn spawn_worker(behavior: WorkerBehavior) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/invoke", post(worker_invoke))
        .with_state(behavior);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn table_for(endpoint: &str, defaults: Value) -> Arc<RouteTable> {
    let blob = json!({
        "rules": [
            {
                "name": "alpha-rule",
                "priority": 10,
                "match": {"agent": "alpha"},
                "backends": [
                    {"agentName": "alpha", "namespace": "agents",
                     "endpoint": endpoint, "weight": 100, "ready": true}
                ]
            }
        ],
        "defaults": defaults,
    });

    let table = Arc::new(RouteTable::new());
    table
        .load_from_json(&serde_json::to_vec(&blob).unwrap())
        .unwrap();
    table
}

fn default_limits() -> Value {
    json!({
        "maxConcurrent": 100, "maxQueueSize": 50,
        "queueTimeoutMs": 30000, "requestTimeoutMs": 10000,
        "rejectUnmatched": false
    })
}

fn invoke_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/invoke")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_explicit_agent_dispatch_round_trip() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({"response": "hi"}),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let metrics = Arc::new(GatewayMetrics::new());
    let state = Arc::new(ApiState::new(
        table_for(&endpoint, default_limits()),
        metrics,
        Duration::from_secs(10),
    ));
    state.apply_table_defaults();
    let app = api::router(state);

    let response = app
        .oneshot(invoke_request(json!({"agent": "alpha", "query": "hi"})))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["response"], "hi");
    assert_eq!(body["agent"], "alpha");
    assert!(body["latencyMs"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn test_no_match_returns_not_found() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({}),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let state = Arc::new(ApiState::new(
        table_for(&endpoint, default_limits()),
        Arc::new(GatewayMetrics::new()),
        Duration::from_secs(10),
    ));
    state.apply_table_defaults();
    let app = api::router(state);

    let response = app
        .oneshot(invoke_request(json!({"intent": "docs", "query": "?"})))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "no available agent for this request");
}

#[tokio::test]
async fn test_reject_unmatched_returns_bad_request() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({}),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let mut defaults = default_limits();
    defaults["rejectUnmatched"] = json!(true);
    let state = Arc::new(ApiState::new(
        table_for(&endpoint, defaults),
        Arc::new(GatewayMetrics::new()),
        Duration::from_secs(10),
    ));
    state.apply_table_defaults();
    let app = api::router(state);

    let response = app
        .oneshot(invoke_request(json!({"intent": "docs", "query": "?"})))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "no matching route found");
}

#[tokio::test]
async fn test_worker_error_maps_to_bad_gateway() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({"error": "boom"}),
        status: StatusCode::INTERNAL_SERVER_ERROR,
        delay: Duration::ZERO,
    })
    .await;

    let state = Arc::new(ApiState::new(
        table_for(&endpoint, default_limits()),
        Arc::new(GatewayMetrics::new()),
        Duration::from_secs(10),
    ));
    state.apply_table_defaults();
    let app = api::router(state);

    let response = app
        .oneshot(invoke_request(json!({"agent": "alpha", "query": "x"})))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("agent error"));
}

#[tokio::test]
async fn test_invalid_body_returns_bad_request() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({}),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let state = Arc::new(ApiState::new(
        table_for(&endpoint, default_limits()),
        Arc::new(GatewayMetrics::new()),
        Duration::from_secs(10),
    ));
    let app = api::router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/invoke")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid request body"));
}

#[tokio::test]
async fn test_admission_rejects_third_request_when_queue_full() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({"response": "slow"}),
        status: StatusCode::OK,
        delay: Duration::from_secs(1),
    })
    .await;

    let defaults = json!({
        "maxConcurrent": 1, "maxQueueSize": 1,
        "queueTimeoutMs": 10000, "requestTimeoutMs": 10000,
        "rejectUnmatched": false
    });
    let metrics = Arc::new(GatewayMetrics::new());
    let state = Arc::new(ApiState::new(
        table_for(&endpoint, defaults),
        metrics.clone(),
        Duration::from_secs(10),
    ));
    state.apply_table_defaults();
    let app = api::router(state);

    // First request occupies the slot, second queues
    let first = {
        let app = app.clone();
        tokio::spawn(async move {
            app.oneshot(invoke_request(json!({"agent": "alpha", "query": "1"})))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = {
        let app = app.clone();
        tokio::spawn(async move {
            app.oneshot(invoke_request(json!({"agent": "alpha", "query": "2"})))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Third is rejected immediately with a classified error
    let response = app
        .oneshot(invoke_request(json!({"agent": "alpha", "query": "3"})))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "queue full: cannot accept more requests");
    assert_eq!(metrics.circuit_rejections("alpha-rule", "queue_full"), 1);

    // The first two eventually succeed
    let (status, _) = response_json(first.await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = response_json(second.await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_list_agents_and_routes() {
    let endpoint = spawn_worker(WorkerBehavior {
        response: json!({}),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let state = Arc::new(ApiState::new(
        table_for(&endpoint, default_limits()),
        Arc::new(GatewayMetrics::new()),
        Duration::from_secs(10),
    ));
    let app = api::router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/agents")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"][0], "agents/alpha");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/routes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routes"][0], "alpha-rule");
    assert_eq!(body["count"], 1);
}
