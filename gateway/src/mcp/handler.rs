//! MCP request handling over both transports.
//!
//! POST /mcp answers each JSON-RPC request directly. GET /mcp/sse opens a
//! long-lived event stream: the server immediately names a per-session
//! POST URL in an `endpoint` event, replies to POSTs on that URL over the
//! stream, and pings every 30 seconds. Session state is process-local.

use super::types::{
    CallToolParams, CallToolResult, Capabilities, Implementation, InitializeResult,
    ListToolsResult, Notification, Request, Response as RpcResponse, Tool, ToolsCapability,
    ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_INVALID_REQUEST, ERR_METHOD_NOT_FOUND, ERR_PARSE,
};
use crate::dispatch::{unwrap_text, ForwardRequest, Forwarder};
use crate::metrics::GatewayMetrics;
use crate::watcher::AgentWatcher;
use agentmesh_operator::crds::Agent;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "agentmesh-gateway";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

/// One streaming session: a single writer feeding the event stream.
struct Session {
    id: u64,
    initialized: AtomicBool,
    tx: mpsc::UnboundedSender<Event>,
}

impl Session {
    fn send_event(&self, event: Event) {
        // Receiver gone means the client disconnected; drop silently
        let _ = self.tx.send(event);
    }

    fn send_message(&self, payload: &impl serde::Serialize) {
        match serde_json::to_string(payload) {
            Ok(data) => self.send_event(Event::default().event("message").data(data)),
            Err(e) => warn!("Failed to serialize SSE message: {e}"),
        }
    }
}

/// Shared state for the MCP endpoint.
pub struct McpState {
    watcher: Arc<AgentWatcher>,
    forwarder: Forwarder,
    metrics: Arc<GatewayMetrics>,
    sessions: DashMap<u64, Arc<Session>>,
    session_counter: AtomicU64,
    sse_connections: AtomicI64,
}

impl McpState {
    pub fn new(watcher: Arc<AgentWatcher>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            watcher,
            forwarder: Forwarder::new(),
            metrics,
            sessions: DashMap::new(),
            session_counter: AtomicU64::new(0),
            sse_connections: AtomicI64::new(0),
        }
    }

    /// Tell every initialized streaming session the tool list changed.
    /// Fire-and-forget: a slow client can miss it and re-issue
    /// tools/list at any time.
    pub fn notify_tools_list_changed(&self) {
        let notification = Notification {
            jsonrpc: "2.0",
            method: "notifications/tools/list_changed",
        };
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.initialized.load(Ordering::Relaxed) {
                session.send_message(&notification);
            }
        }
    }

    /// Number of live streaming sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Build the /mcp router.
pub fn router(state: Arc<McpState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_http))
        .route("/mcp/sse", get(handle_sse))
        .route("/mcp/message", post(handle_message))
        .with_state(state)
}

/// Request/response transport: one POST, one JSON-RPC reply.
async fn handle_http(State(state): State<Arc<McpState>>, body: Bytes) -> Response {
    let start = Instant::now();

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(RpcResponse::error(
                None,
                ERR_PARSE,
                "Parse error",
                Some(json!(e.to_string())),
            ))
            .into_response();
        }
    };

    debug!("MCP HTTP request: method={} id={:?}", request.method, request.id);
    let method = request.method.clone();

    let response = dispatch_request(&state, request, None).await;

    state
        .metrics
        .record_mcp_request(&method, "http", start.elapsed().as_secs_f64());

    Json(response).into_response()
}

/// Handle one request; `session` is set on the streaming transport so the
/// `initialized` notification can mark it.
async fn dispatch_request(
    state: &Arc<McpState>,
    request: Request,
    session: Option<&Session>,
) -> RpcResponse {
    if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
        return RpcResponse::error(
            request.id,
            ERR_INVALID_REQUEST,
            "Invalid request",
            Some(json!("unsupported jsonrpc version")),
        );
    }

    match request.method.as_str() {
        "initialize" => RpcResponse::result(
            request.id,
            serde_json::to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION,
                capabilities: Capabilities {
                    tools: Some(ToolsCapability { list_changed: true }),
                },
                server_info: Implementation {
                    name: SERVER_NAME,
                    version: SERVER_VERSION,
                },
            })
            .unwrap_or_default(),
        ),
        "initialized" => {
            if let Some(session) = session {
                session.initialized.store(true, Ordering::Relaxed);
            }
            RpcResponse::result(request.id, json!({}))
        }
        "tools/list" => {
            state.metrics.record_mcp_tools_list();
            let tools = build_tools_list(&state.watcher);
            RpcResponse::result(
                request.id,
                serde_json::to_value(ListToolsResult { tools }).unwrap_or_default(),
            )
        }
        "tools/call" => {
            let params: CallToolParams = match request
                .params
                .map(serde_json::from_value)
                .transpose()
            {
                Ok(params) => params.unwrap_or_default(),
                Err(e) => {
                    return RpcResponse::error(
                        request.id,
                        ERR_INVALID_PARAMS,
                        "Invalid params",
                        Some(json!(e.to_string())),
                    );
                }
            };
            match call_tool(state, params).await {
                Ok(result) => RpcResponse::result(
                    request.id,
                    serde_json::to_value(result).unwrap_or_default(),
                ),
                Err((code, message, data)) => {
                    RpcResponse::error(request.id, code, &message, data)
                }
            }
        }
        "ping" => RpcResponse::result(request.id, json!({})),
        other => RpcResponse::error(
            request.id,
            ERR_METHOD_NOT_FOUND,
            "Method not found",
            Some(json!(other)),
        ),
    }
}

/// Enumerate ready agents as tools: one per advertised function, or one
/// per agent with a default query schema when it advertises none.
fn build_tools_list(watcher: &AgentWatcher) -> Vec<Tool> {
    let mut tools = Vec::new();

    for agent in watcher.list_ready() {
        let agent_name = agent.metadata.name.clone().unwrap_or_default();

        let agent_tools = agent
            .status
            .as_ref()
            .filter(|s| !s.available_tools.is_empty())
            .map(|s| s.available_tools.clone())
            .unwrap_or_else(|| agent.spec.tools.clone());

        if agent_tools.is_empty() {
            tools.push(Tool {
                name: agent_name,
                description: extract_description(&agent.spec.prompt),
                input_schema: default_input_schema(),
            });
        } else {
            for tool in agent_tools {
                tools.push(Tool {
                    name: format!("{agent_name}_{}", tool.name),
                    description: tool.description,
                    input_schema: tool.input_schema.unwrap_or_else(default_input_schema),
                });
            }
        }
    }

    tools
}

/// Resolve `<agent>_<tool>`, synthesize a query and forward to the worker.
async fn call_tool(
    state: &Arc<McpState>,
    params: CallToolParams,
) -> Result<CallToolResult, (i64, String, Option<Value>)> {
    // Split at the first underscore: the prefix names the agent
    let (agent_name, tool_name) = match params.name.split_once('_') {
        Some((agent, tool)) if !agent.is_empty() => (agent.to_string(), tool.to_string()),
        _ => (params.name.clone(), String::new()),
    };

    state.metrics.record_mcp_tools_call(&agent_name, &tool_name);
    debug!("MCP tool call: agent={agent_name} tool={tool_name}");

    let Some(agent) = state.watcher.get_by_name(&agent_name) else {
        warn!("MCP tool call for unknown agent: {agent_name}");
        return Err((
            ERR_INVALID_PARAMS,
            "Agent not found".to_string(),
            Some(json!(agent_name)),
        ));
    };

    let agent_status = agent.status.as_ref();
    if !agent_status.is_some_and(|s| s.ready) {
        warn!("MCP tool call for not-ready agent: {agent_name}");
        return Err((
            ERR_INTERNAL,
            "Agent not ready".to_string(),
            Some(json!(agent_name)),
        ));
    }

    let query = synthesize_query(&params.arguments);
    let endpoint = agent_status
        .and_then(|s| s.endpoint.clone())
        .unwrap_or_default();

    let forwarded = state
        .forwarder
        .forward(
            &endpoint,
            &ForwardRequest {
                query,
                input: Some(Value::Object(params.arguments)),
                metadata: Some(json!({"source": "mcp"})),
                ..Default::default()
            },
            forward_timeout(&agent),
        )
        .await;

    match forwarded {
        Ok(value) => Ok(CallToolResult::text(unwrap_text(&value))),
        Err(e) => {
            warn!("MCP forward to {agent_name} failed: {e}");
            Ok(CallToolResult::error(format!("Error: {e}")))
        }
    }
}

fn forward_timeout(agent: &Agent) -> Duration {
    agent
        .spec
        .policy
        .as_ref()
        .and_then(|p| humantime::parse_duration(&p.request_timeout).ok())
        .unwrap_or(FORWARD_TIMEOUT)
}

/// Build the worker query from well-known argument names, falling back to
/// a "key: value" concatenation of every string argument.
fn synthesize_query(arguments: &serde_json::Map<String, Value>) -> String {
    for key in ["query", "question", "request", "description"] {
        if let Some(text) = arguments.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return text.to_string();
            }
        }
    }

    let parts: Vec<String> = arguments
        .iter()
        .filter_map(|(key, value)| {
            value
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| format!("{key}: {s}"))
        })
        .collect();
    parts.join("\n")
}

/// First sentence of the prompt, capped at 200 characters.
fn extract_description(prompt: &str) -> String {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return "AI agent".to_string();
    }

    if let Some(idx) = prompt.find('.') {
        if idx > 0 && idx < 200 {
            return prompt[..=idx].to_string();
        }
    }

    if prompt.chars().count() > 200 {
        let truncated: String = prompt.chars().take(197).collect();
        return format!("{truncated}...");
    }
    prompt.to_string()
}

fn default_input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The query or task for the agent",
            }
        },
        "required": ["query"],
    })
}

/// Event stream that unregisters its session on disconnect.
struct SessionStream {
    inner: UnboundedReceiverStream<Event>,
    state: Arc<McpState>,
    session_id: u64,
}

impl Stream for SessionStream {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx).map(|e| e.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.state.sessions.remove(&self.session_id);
        let active = self.state.sse_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        self.state.metrics.set_mcp_connections("sse", active);
        info!("MCP SSE session ended: {}", self.session_id);
    }
}

/// Streaming transport: open the event stream and name the per-session
/// POST URL.
async fn handle_sse(
    State(state): State<Arc<McpState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session_id = state.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, rx) = mpsc::unbounded_channel();

    let session = Arc::new(Session {
        id: session_id,
        initialized: AtomicBool::new(false),
        tx,
    });
    state.sessions.insert(session_id, session.clone());

    let active = state.sse_connections.fetch_add(1, Ordering::Relaxed) + 1;
    state.metrics.set_mcp_connections("sse", active);
    info!("MCP SSE session started: {session_id}");

    session.send_event(
        Event::default()
            .event("endpoint")
            .data(format!("/mcp/message?sessionId={session_id}")),
    );

    // Keep-alive pings until the client goes away
    let ping_session = session.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ping_session
                .tx
                .send(Event::default().event("ping").data(""))
                .is_err()
            {
                break;
            }
        }
    });

    Sse::new(SessionStream {
        inner: UnboundedReceiverStream::new(rx),
        state,
        session_id,
    })
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<u64>,
}

/// Per-session POST endpoint for the streaming transport: replies are
/// delivered over the event stream, the POST itself just acknowledges.
async fn handle_message(
    State(state): State<Arc<McpState>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    let Some(session_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId").into_response();
    };

    let Some(session) = state.sessions.get(&session_id).map(|s| s.value().clone()) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            session.send_message(&RpcResponse::error(
                None,
                ERR_PARSE,
                "Parse error",
                Some(json!(e.to_string())),
            ));
            return StatusCode::ACCEPTED.into_response();
        }
    };

    debug!(
        "MCP SSE request: session={} method={} id={:?}",
        session.id, request.method, request.id
    );
    let method = request.method.clone();
    let is_initialized_note = method == "initialized";

    let response = dispatch_request(&state, request, Some(&session)).await;

    // Notifications get no reply on the stream
    if !is_initialized_note {
        session.send_message(&response);
    }

    state
        .metrics
        .record_mcp_request(&method, "sse", start.elapsed().as_secs_f64());

    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_operator::crds::{AgentSpec, AgentStatus, AgentTool, ModelConfig};

    fn agent(name: &str, prompt: &str, tools: Vec<AgentTool>, ready: bool) -> Agent {
        let mut agent = Agent::new(
            name,
            AgentSpec {
                prompt: prompt.to_string(),
                model: ModelConfig {
                    provider: "anthropic".to_string(),
                    model_id: "claude-sonnet-4-20250514".to_string(),
                    temperature: None,
                    max_tokens: None,
                    endpoint: None,
                },
                tool_refs: Vec::new(),
                policy: None,
                network: None,
                replicas: 1,
                resources: None,
                image: None,
                service_account_name: None,
                env: Default::default(),
                env_from_secrets: Vec::new(),
                env_from: Vec::new(),
                node_selector: Default::default(),
                tools: tools.clone(),
            },
        );
        agent.metadata.namespace = Some("agents".to_string());
        agent.status = Some(AgentStatus {
            ready,
            endpoint: ready.then(|| format!("{name}.agents.svc.cluster.local:8080")),
            available_tools: if ready { tools } else { Vec::new() },
            ..Default::default()
        });
        agent
    }

    fn tool(name: &str) -> AgentTool {
        AgentTool {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: None,
        }
    }

    #[test]
    fn test_tools_list_prefixes_agent_name() {
        let watcher = AgentWatcher::new();
        watcher.insert(agent("alpha", "Does things.", vec![tool("x")], true));

        let tools = build_tools_list(&watcher);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "alpha_x");
        assert_eq!(tools[0].description, "x tool");
    }

    #[test]
    fn test_tools_list_default_tool_for_bare_agent() {
        let watcher = AgentWatcher::new();
        watcher.insert(agent(
            "writer",
            "Writes marketing copy. Anything else too.",
            vec![],
            true,
        ));

        let tools = build_tools_list(&watcher);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "writer");
        assert_eq!(tools[0].description, "Writes marketing copy.");
        assert_eq!(tools[0].input_schema["required"][0], "query");
    }

    #[test]
    fn test_tools_list_skips_not_ready_agents() {
        let watcher = AgentWatcher::new();
        watcher.insert(agent("down", "Down agent.", vec![tool("x")], false));
        assert!(build_tools_list(&watcher).is_empty());
    }

    #[test]
    fn test_synthesize_query_priority_order() {
        let args: serde_json::Map<String, Value> = serde_json::from_value(json!({
            "description": "third choice",
            "question": "second choice",
            "query": "first choice",
        }))
        .unwrap();
        assert_eq!(synthesize_query(&args), "first choice");

        let args: serde_json::Map<String, Value> =
            serde_json::from_value(json!({"question": "second choice"})).unwrap();
        assert_eq!(synthesize_query(&args), "second choice");
    }

    #[test]
    fn test_synthesize_query_concatenates_string_args() {
        let args: serde_json::Map<String, Value> = serde_json::from_value(json!({
            "region": "eu-west-1",
            "service": "api",
            "count": 3,
        }))
        .unwrap();
        let query = synthesize_query(&args);
        assert!(query.contains("region: eu-west-1"));
        assert!(query.contains("service: api"));
        assert!(!query.contains("count"));
    }

    #[test]
    fn test_extract_description() {
        assert_eq!(extract_description(""), "AI agent");
        assert_eq!(
            extract_description("Analyzes cloud costs. Detail follows."),
            "Analyzes cloud costs."
        );

        let long = "x".repeat(300);
        let description = extract_description(&long);
        assert_eq!(description.chars().count(), 200);
        assert!(description.ends_with("..."));
    }

    #[tokio::test]
    async fn test_dispatch_initialize() {
        let state = Arc::new(McpState::new(
            Arc::new(AgentWatcher::new()),
            Arc::new(GatewayMetrics::new()),
        ));
        let response = dispatch_request(
            &state,
            Request {
                jsonrpc: "2.0".to_string(),
                id: Some(json!(1)),
                method: "initialize".to_string(),
                params: None,
            },
            None,
        )
        .await;

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let state = Arc::new(McpState::new(
            Arc::new(AgentWatcher::new()),
            Arc::new(GatewayMetrics::new()),
        ));
        let response = dispatch_request(
            &state,
            Request {
                jsonrpc: "2.0".to_string(),
                id: Some(json!(7)),
                method: "resources/list".to_string(),
                params: None,
            },
            None,
        )
        .await;

        assert_eq!(response.error.unwrap().code, ERR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_call_tool_unknown_agent() {
        let state = Arc::new(McpState::new(
            Arc::new(AgentWatcher::new()),
            Arc::new(GatewayMetrics::new()),
        ));
        let err = call_tool(
            &state,
            CallToolParams {
                name: "ghost_x".to_string(),
                arguments: Default::default(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, ERR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_call_tool_not_ready_agent() {
        let watcher = Arc::new(AgentWatcher::new());
        watcher.insert(agent("down", "Down.", vec![tool("x")], false));
        let state = Arc::new(McpState::new(watcher, Arc::new(GatewayMetrics::new())));

        let err = call_tool(
            &state,
            CallToolParams {
                name: "down_x".to_string(),
                arguments: Default::default(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, ERR_INTERNAL);
    }
}
