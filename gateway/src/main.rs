//! Gateway entrypoint: route table bootstrap, hot reload, the /v1 and
//! /mcp surfaces, metrics listener and graceful shutdown.

use agentmesh_gateway::mcp::{self, McpState};
use agentmesh_gateway::reload::watch_routes_file;
use agentmesh_gateway::{api, AgentWatcher, ApiState, GatewayMetrics, RouteTable};
use anyhow::Context as _;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agentmesh-gateway", about = "agentmesh request gateway")]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = ":8080", env = "GATEWAY_ADDR")]
    addr: String,

    /// Metrics listen address
    #[arg(long, default_value = ":9090", env = "METRICS_ADDR")]
    metrics_addr: String,

    /// Path to the compiled routes file
    #[arg(long, default_value = "/etc/gateway/routes.json", env = "ROUTES_FILE")]
    routes_file: PathBuf,

    /// Request timeout for worker calls (humantime string)
    #[arg(long, default_value = "5m", env = "REQUEST_TIMEOUT")]
    request_timeout: String,

    /// Enable the MCP protocol endpoints
    #[arg(long, default_value_t = true, env = "ENABLE_MCP", action = clap::ArgAction::Set)]
    mcp_enabled: bool,

    /// Namespace to watch for agents (empty = all namespaces)
    #[arg(long, default_value = "", env = "WATCH_NAMESPACE")]
    mcp_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let request_timeout = humantime::parse_duration(&args.request_timeout)
        .unwrap_or(Duration::from_secs(300));

    info!(
        "Starting agent gateway on {} (mcp={}, metrics={})",
        args.addr, args.mcp_enabled, args.metrics_addr
    );

    let metrics = Arc::new(GatewayMetrics::new());
    let table = Arc::new(RouteTable::new());

    match table.load_from_file(&args.routes_file) {
        Ok(()) => info!("Loaded routes from {}", args.routes_file.display()),
        Err(e) => warn!("Failed to load routes from {}: {e}", args.routes_file.display()),
    }

    let state = Arc::new(ApiState::new(table, metrics.clone(), request_timeout));
    state.apply_table_defaults();

    if let Err(e) = watch_routes_file(args.routes_file.clone(), state.clone()) {
        warn!("Failed to watch routes file: {e}");
    }

    let mut app = api::router(state);

    // MCP needs a cluster connection for agent discovery; without one the
    // endpoint stays off and the /v1 surface still works.
    if args.mcp_enabled {
        match kube::Client::try_default().await {
            Ok(client) => {
                let watcher = Arc::new(AgentWatcher::new());
                let mcp_state = Arc::new(McpState::new(watcher.clone(), metrics.clone()));

                let namespace =
                    (!args.mcp_namespace.is_empty()).then(|| args.mcp_namespace.clone());
                tokio::spawn(watcher.clone().run(client, namespace));

                // Ready-set changes fan out to initialized streaming sessions
                let notify_state = mcp_state.clone();
                let mut changes = watcher.subscribe();
                tokio::spawn(async move {
                    while changes.recv().await.is_ok() {
                        notify_state.notify_tools_list_changed();
                    }
                });

                app = app.merge(mcp::router(mcp_state));
                info!("MCP endpoints enabled: /mcp (HTTP), /mcp/sse (SSE)");
            }
            Err(e) => warn!("Failed to create Kubernetes client: {e} (MCP disabled)"),
        }
    }

    let app = app.layer(TraceLayer::new_for_http());

    // Metrics listener
    let metrics_router = Router::new()
        .route("/metrics", get(export_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(metrics);
    let metrics_addr = normalize_addr(&args.metrics_addr);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics address {metrics_addr}"))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
            warn!("Metrics server error: {e}");
        }
    });

    let addr = normalize_addr(&args.addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind listen address {addr}"))?;
    info!("Agent gateway listening on {addr} (metrics on {metrics_addr})");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Servers stopped");
    Ok(())
}

async fn export_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> String {
    metrics.export()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutting down servers...");
}

/// LOG_LEVEL selects the default filter; RUST_LOG still wins when set.
fn init_logging() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Accept Go-style ":8080" listen addresses.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
