//! MCP protocol implementation: JSON-RPC 2.0 framing plus the MCP message
//! vocabulary spoken on both sides of the proxy.

pub mod capabilities;
pub mod jsonrpc;
pub mod messages;

pub use capabilities::{ClientCapabilities, ServerCapabilities, ToolsCapability};
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
    JSONRPC_VERSION,
};
pub use messages::{
    catalog_hash, ClientInfo, InitializeParams, InitializeResult, ServerInfo, Tool, ToolContent,
    ToolsCallParams, ToolsCallResult, ToolsListResult,
};

/// Protocol version this implementation speaks by default
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Protocol versions accepted from peers
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// Pick the version to answer a peer's `initialize` with: echo theirs when
/// supported, otherwise fall back to our default.
pub fn negotiate_protocol_version(peer_version: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == peer_version)
        .copied()
        .unwrap_or(MCP_PROTOCOL_VERSION)
}

/// Method names used across the proxy
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
}
