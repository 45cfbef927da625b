//! Model Context Protocol endpoint (JSON-RPC 2.0 over HTTP and SSE).

mod handler;
pub mod types;

pub use handler::{router, McpState, PROTOCOL_VERSION};
