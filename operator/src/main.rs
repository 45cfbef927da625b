//! Operator entrypoint: starts the controllers plus the metrics and
//! health listeners.

use agentmesh_operator::metrics::ControllerMetrics;
use agentmesh_operator::run_controllers;
use anyhow::Context as _;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agentmesh-operator", about = "agentmesh control plane operator")]
struct Args {
    /// Address for the metrics endpoint
    #[arg(long, default_value = ":8082", env = "METRICS_ADDR")]
    metrics_addr: String,

    /// Namespace where the compiled routes ConfigMap is published
    #[arg(
        long,
        default_value = agentmesh_operator::render::GATEWAY_NAMESPACE,
        env = "GATEWAY_NAMESPACE"
    )]
    gateway_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let metrics = Arc::new(ControllerMetrics::new());

    let metrics_addr = normalize_addr(&args.metrics_addr);
    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics address {metrics_addr}"))?;

    info!("Metrics listening on {metrics_addr}");
    let metrics_router = Router::new()
        .route("/metrics", get(export_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(metrics.clone());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics_router).await {
            warn!("Metrics server error: {e}");
        }
    });

    run_controllers(client, args.gateway_namespace, metrics).await?;
    Ok(())
}

async fn export_metrics(State(metrics): State<Arc<ControllerMetrics>>) -> String {
    metrics.export()
}

/// LOG_LEVEL selects the default filter; RUST_LOG still wins when set.
fn init_logging() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Accept Go-style ":8082" listen addresses.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
