#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! agentmesh gateway core library
//!
//! Dispatches client requests to agent workers: compiled route table with
//! hot reload, weighted/sticky backend selection, per-route admission
//! control, downstream forwarding and the MCP protocol endpoint.

pub mod api;
pub mod circuit;
pub mod dispatch;
pub mod mcp;
pub mod metrics;
pub mod reload;
pub mod selector;
pub mod table;
pub mod watcher;

pub use api::{ApiState, InvokeRequest, InvokeResponse};
pub use circuit::{AcquireError, Breaker, BreakerConfig, BreakerManager};
pub use metrics::GatewayMetrics;
pub use table::{MatchRequest, MatchResult, RouteTable};
pub use watcher::AgentWatcher;
