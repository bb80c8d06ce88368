//! MCP message vocabulary: initialize, tool discovery and tool invocation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::capabilities::{ClientCapabilities, ServerCapabilities};

/// Parameters for the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    #[serde(default)]
    pub capabilities: ClientCapabilities,

    #[serde(rename = "clientInfo", skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    #[serde(default)]
    pub capabilities: ServerCapabilities,

    #[serde(rename = "serverInfo", skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Tool definition as advertised over `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Result of `tools/list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<Tool>,

    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Parameters for `tools/call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Result of `tools/call`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,

    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ToolsCallResult {
    /// Single text block result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Single text block flagged as a tool-level error
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

/// One content block in a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image {
        data: String,

        #[serde(rename = "mimeType")]
        mime_type: String,
    },

    #[serde(rename = "resource")]
    Resource { resource: Value },
}

/// Content hash over a tool catalog: name, description and schema per tool,
/// order-independent. Used to suppress no-op `tools/list_changed` churn.
pub fn catalog_hash(tools: &[Tool]) -> String {
    let mut lines: Vec<String> = tools
        .iter()
        .map(|t| {
            format!(
                "{}\u{0}{}\u{0}{}",
                t.name,
                t.description,
                canonical_schema(&t.input_schema)
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update([0u8]);
    }
    hex_digest(hasher)
}

fn canonical_schema(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonical_schema(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_schema).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, desc: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: desc.to_string(),
            input_schema: json!({"type": "object", "properties": {"a": {"type": "integer"}}}),
        }
    }

    #[test]
    fn test_tools_list_parse_with_missing_fields() {
        let result: ToolsListResult = serde_json::from_value(json!({
            "tools": [{ "name": "add" }]
        }))
        .unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].description, "");
        assert_eq!(result.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn test_call_result_shapes() {
        let ok = ToolsCallResult::text("5");
        let frame = serde_json::to_value(&ok).unwrap();
        assert_eq!(frame["content"][0]["type"], "text");
        assert!(frame.get("isError").is_none());

        let err = ToolsCallResult::error_text("boom");
        let frame = serde_json::to_value(&err).unwrap();
        assert_eq!(frame["isError"], true);
    }

    #[test]
    fn test_catalog_hash_is_order_independent() {
        let a = vec![tool("add", "adds"), tool("sub", "subtracts")];
        let b = vec![tool("sub", "subtracts"), tool("add", "adds")];
        assert_eq!(catalog_hash(&a), catalog_hash(&b));
    }

    #[test]
    fn test_catalog_hash_sees_description_changes() {
        let a = vec![tool("add", "adds")];
        let b = vec![tool("add", "adds two integers")];
        assert_ne!(catalog_hash(&a), catalog_hash(&b));
    }

    #[test]
    fn test_catalog_hash_sees_schema_key_order_as_equal() {
        let mut t1 = tool("add", "adds");
        t1.input_schema = json!({"properties": {"a": {}}, "type": "object"});
        let mut t2 = tool("add", "adds");
        t2.input_schema = json!({"type": "object", "properties": {"a": {}}});
        assert_eq!(catalog_hash(&[t1]), catalog_hash(&[t2]));
    }
}
