//! The resolved configuration snapshot consumed by the core.
//!
//! Snapshots are copy-on-read: a reload produces a whole new value that the
//! service manager diffs against the running state. Nothing in the core
//! mutates a snapshot after construction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::custom::{validate_tool_set, CustomToolConfig};
use crate::error::ConfigResult;
use crate::service::{ServiceConfig, ServiceDecl};

/// A field that accepts either a single value or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// Per-tool override from the `mcpServerConfig` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ToolOverride {
    fn default() -> Self {
        Self {
            enable: true,
            description: None,
        }
    }
}

/// Tool overrides for one downstream service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerToolConfig {
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
}

/// Coze workflow platform credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CozeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(rename = "baseURL", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Workflow platform section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub coze: CozeConfig,
}

/// ModelScope section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelScopeConfig {
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Connection tuning shared by endpoint sessions and downstream services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Interval between liveness probes on established connections
    #[serde(
        with = "humantime_serde",
        rename = "heartbeatInterval",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,

    /// How long to wait for a probe answer before declaring the peer dead
    #[serde(
        with = "humantime_serde",
        rename = "heartbeatTimeout",
        default = "default_heartbeat_timeout"
    )]
    pub heartbeat_timeout: Duration,

    /// Seed delay for reconnection backoff
    #[serde(
        with = "humantime_serde",
        rename = "reconnectInterval",
        default = "default_reconnect_interval"
    )]
    pub reconnect_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

/// CustomMCP section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomMcpConfig {
    #[serde(default)]
    pub tools: Vec<CustomToolConfig>,
}

/// The complete resolved snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Upstream agent endpoint URL(s)
    #[serde(rename = "mcpEndpoint", default)]
    pub mcp_endpoint: OneOrMany<String>,

    /// Downstream service declarations, keyed by service name
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ServiceDecl>,

    /// Per-service tool overrides (enable flags, description rewrites)
    #[serde(rename = "mcpServerConfig", default)]
    pub mcp_server_config: HashMap<String, ServerToolConfig>,

    #[serde(rename = "customMCP", default)]
    pub custom_mcp: CustomMcpConfig,

    #[serde(default)]
    pub platforms: PlatformsConfig,

    #[serde(default)]
    pub modelscope: ModelScopeConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl ConfigSnapshot {
    /// Upstream endpoint URLs in declaration order
    pub fn endpoints(&self) -> Vec<String> {
        self.mcp_endpoint.to_vec()
    }

    /// Resolve every declared service into a concrete transport config.
    ///
    /// Resolution is all-or-nothing: one malformed entry fails the whole
    /// snapshot so the offense is surfaced exactly once, at load time.
    pub fn resolved_services(&self) -> ConfigResult<Vec<ServiceConfig>> {
        let mut services: Vec<ServiceConfig> = Vec::with_capacity(self.mcp_servers.len());
        let mut names: Vec<&String> = self.mcp_servers.keys().collect();
        names.sort();
        for name in names {
            let decl = &self.mcp_servers[name];
            services.push(decl.resolve(name, self.modelscope.api_key.as_deref())?);
        }
        Ok(services)
    }

    /// Validated CustomMCP tool set
    pub fn custom_tools(&self) -> ConfigResult<&[CustomToolConfig]> {
        validate_tool_set(&self.custom_mcp.tools)?;
        Ok(&self.custom_mcp.tools)
    }

    /// Whether a tool is enabled, consulting the per-service overrides.
    /// Tools with no override are enabled.
    pub fn tool_enabled(&self, service: &str, original_name: &str) -> bool {
        self.mcp_server_config
            .get(service)
            .and_then(|sc| sc.tools.get(original_name))
            .map(|t| t.enable)
            .unwrap_or(true)
    }

    /// Description override for a tool, when configured
    pub fn tool_description(&self, service: &str, original_name: &str) -> Option<&str> {
        self.mcp_server_config
            .get(service)
            .and_then(|sc| sc.tools.get(original_name))
            .and_then(|t| t.description.as_deref())
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_deserialization() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "mcpEndpoint": "wss://agent.example.com/mcp",
            "mcpServers": {
                "calc": { "command": "echo-mcp", "args": ["--stdio"] },
                "remote": { "url": "https://example.com/api/sse" }
            },
            "mcpServerConfig": {
                "calc": { "tools": { "add": { "enable": false } } }
            },
            "connection": { "heartbeatInterval": "15s" }
        }))
        .unwrap();

        assert_eq!(snapshot.endpoints(), vec!["wss://agent.example.com/mcp"]);
        assert_eq!(snapshot.connection.heartbeat_interval, Duration::from_secs(15));
        assert!(!snapshot.tool_enabled("calc", "add"));
        assert!(snapshot.tool_enabled("calc", "sub"));
        assert!(snapshot.tool_enabled("unknown", "anything"));

        let services = snapshot.resolved_services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "calc");
        assert_eq!(services[1].transport.type_name(), "sse");
    }

    #[test]
    fn test_endpoint_list_form() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "mcpEndpoint": ["wss://a.example.com", "wss://b.example.com"]
        }))
        .unwrap();
        assert_eq!(snapshot.endpoints().len(), 2);
    }

    #[test]
    fn test_resolution_is_all_or_nothing() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "mcpServers": {
                "good": { "command": "ok" },
                "bad": {}
            }
        }))
        .unwrap();
        assert!(snapshot.resolved_services().is_err());
    }

    #[test]
    fn test_empty_snapshot_defaults() {
        let snapshot = ConfigSnapshot::default();
        assert!(snapshot.endpoints().is_empty());
        assert!(snapshot.resolved_services().unwrap().is_empty());
        assert!(snapshot.custom_tools().unwrap().is_empty());
        assert_eq!(
            snapshot.connection.reconnect_interval,
            Duration::from_secs(1)
        );
    }
}
