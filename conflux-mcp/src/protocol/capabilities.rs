//! Capability advertisement for the initialize handshake

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Capabilities the proxy advertises when acting as an MCP client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Unknown capability blocks are preserved round-trip
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Capabilities a server advertises in its initialize result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerCapabilities {
    /// The capability set the proxy advertises toward upstream agents
    pub fn aggregating() -> Self {
        Self {
            tools: Some(ToolsCapability { list_changed: true }),
            extra: HashMap::new(),
        }
    }

    pub fn supports_list_changed(&self) -> bool {
        self.tools.as_ref().map(|t| t.list_changed).unwrap_or(false)
    }
}

/// The `tools` capability block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}
