#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! agentmesh operator core library
//!
//! Reconciles Agent, Tool, Route and Task resources into worker
//! deployments, services, configuration blobs, a compiled routing table
//! and orchestration Jobs.

pub mod crds;
pub mod metrics;
pub mod reconcile;
pub mod render;

// Re-export commonly used types
pub use crds::{
    Agent, AgentSpec, AgentStatus, Route, RouteSpec, RouteStatus, Task, TaskSpec, TaskStatus,
    Tool, ToolSpec, ToolStatus,
};
pub use reconcile::{run_controllers, Context, Error, Result};
