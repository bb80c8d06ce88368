//! MCP protocol layer for conflux.
//!
//! This crate owns everything that speaks the Model Context Protocol toward
//! downstream services:
//!
//! - **Protocol types**: JSON-RPC 2.0 framing plus the MCP message
//!   vocabulary (initialize, tools/list, tools/call, notifications).
//! - **Transport adapters**: stdio child processes, streamable HTTP
//!   endpoints and SSE streams (including the credentialed ModelScope
//!   flavor), all behind one [`transport::Transport`] trait.
//! - **The service client**: [`service::McpService`], which drives the
//!   handshake, caches the remote tool catalog, correlates request ids and
//!   reconnects with backoff when the transport drops.

pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod service;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{McpError, McpResult};
pub use protocol::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
pub use reconnect::BackoffPolicy;
pub use service::{McpService, ServiceEvent, ServiceHandle, ServiceState};
pub use transport::{Transport, TransportState};
