//! Tool registry: the union view over every ready service plus the
//! CustomMCP handler, keyed by flat tool name.
//!
//! Native tools are namespaced `"<service>__<original>"`, which makes
//! cross-service collisions impossible by construction; CustomMCP names
//! are validated at configuration load to stay out of that namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use conflux_config::ConfigSnapshot;
use conflux_mcp::protocol::Tool;

use crate::custom::CUSTOM_OWNER;

/// Separator between service name and original tool name
pub const NAME_SEPARATOR: &str = "__";

/// One tool as advertised upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    pub description: String,

    #[serde(rename = "inputSchema")]
    pub input_schema: Value,

    /// Which service handles invocations (or the CustomMCP marker)
    #[serde(rename = "ownerServiceName")]
    pub owner: String,

    /// Name as known to the owning service
    #[serde(rename = "originalName")]
    pub original_name: String,

    pub enabled: bool,

    #[serde(rename = "usageCount")]
    pub usage_count: u64,

    #[serde(rename = "lastUsedAt", skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Listing filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFilter {
    All,
    Enabled,
    Disabled,
}

#[derive(Debug, Default, Clone)]
struct UsageStat {
    count: u64,
    last_used_at: Option<DateTime<Utc>>,
}

/// Flat-name → descriptor map. Rebuilt whenever a service changes state or
/// catalog; usage counters survive rebuilds.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    usage: RwLock<HashMap<String, UsageStat>>,
    /// Content hash of the last installed tool set
    content_hash: RwLock<Option<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            content_hash: RwLock::new(None),
        }
    }

    /// Build the flat name for a native tool
    pub fn flat_name(service: &str, original: &str) -> String {
        format!("{}{}{}", service, NAME_SEPARATOR, original)
    }

    /// Recompute the union view. `native` carries the last known catalog of
    /// every Ready service; `custom` is the synthetic tool set. Returns
    /// true when the advertised surface actually changed.
    pub async fn rebuild(
        &self,
        native: &[(String, Arc<Vec<Tool>>)],
        custom: &[Tool],
        snapshot: &ConfigSnapshot,
    ) -> bool {
        let mut next: HashMap<String, ToolDescriptor> = HashMap::new();

        for (service, tools) in native {
            for tool in tools.iter() {
                let name = Self::flat_name(service, &tool.name);
                let description = snapshot
                    .tool_description(service, &tool.name)
                    .unwrap_or(&tool.description)
                    .to_string();
                next.insert(
                    name.clone(),
                    ToolDescriptor {
                        name,
                        description,
                        input_schema: tool.input_schema.clone(),
                        owner: service.clone(),
                        original_name: tool.name.clone(),
                        enabled: snapshot.tool_enabled(service, &tool.name),
                        usage_count: 0,
                        last_used_at: None,
                    },
                );
            }
        }

        for tool in custom {
            if next.contains_key(&tool.name) {
                // Unreachable by construction; guard anyway
                tracing::error!(tool = %tool.name, "custom tool shadows a native name, skipping");
                continue;
            }
            next.insert(
                tool.name.clone(),
                ToolDescriptor {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    owner: CUSTOM_OWNER.to_string(),
                    original_name: tool.name.clone(),
                    enabled: snapshot.tool_enabled(CUSTOM_OWNER, &tool.name),
                    usage_count: 0,
                    last_used_at: None,
                },
            );
        }

        let hash = content_hash(&next);
        let changed = {
            let mut current = self.content_hash.write().await;
            if current.as_deref() == Some(hash.as_str()) {
                false
            } else {
                *current = Some(hash);
                true
            }
        };

        *self.tools.write().await = next;
        changed
    }

    pub async fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        let descriptor = self.tools.read().await.get(name).cloned()?;
        Some(self.merge_usage(descriptor).await)
    }

    /// Snapshot of the current surface, sorted by name
    pub async fn list(&self, filter: ToolFilter) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let usage = self.usage.read().await;

        let mut listed: Vec<ToolDescriptor> = tools
            .values()
            .filter(|t| match filter {
                ToolFilter::All => true,
                ToolFilter::Enabled => t.enabled,
                ToolFilter::Disabled => !t.enabled,
            })
            .cloned()
            .map(|mut t| {
                if let Some(stat) = usage.get(&t.name) {
                    t.usage_count = stat.count;
                    t.last_used_at = stat.last_used_at;
                }
                t
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Bump counters for one call. Best-effort bookkeeping: callers never
    /// fail because of it.
    pub async fn record_usage(&self, name: &str) {
        let mut usage = self.usage.write().await;
        let stat = usage.entry(name.to_string()).or_default();
        stat.count += 1;
        stat.last_used_at = Some(Utc::now());
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    async fn merge_usage(&self, mut descriptor: ToolDescriptor) -> ToolDescriptor {
        if let Some(stat) = self.usage.read().await.get(&descriptor.name) {
            descriptor.usage_count = stat.count;
            descriptor.last_used_at = stat.last_used_at;
        }
        descriptor
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Order-independent hash over (name, description, schema, enabled)
fn content_hash(tools: &HashMap<String, ToolDescriptor>) -> String {
    let ordered: BTreeMap<&String, (&String, String, bool)> = tools
        .iter()
        .map(|(name, t)| (name, (&t.description, t.input_schema.to_string(), t.enabled)))
        .collect();

    let mut hasher = Sha256::new();
    for (name, (description, schema, enabled)) in ordered {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(description.as_bytes());
        hasher.update([0u8]);
        hasher.update(schema.as_bytes());
        hasher.update([0u8]);
        hasher.update([u8::from(enabled)]);
    }
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

    fn native_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
        }
    }

    fn snapshot_with_disabled(service: &str, tool: &str) -> ConfigSnapshot {
        serde_json::from_value(json!({
            "mcpServerConfig": {
                service: { "tools": { tool: { "enable": false } } }
            }
        }))
        .unwrap()
    }

    async fn rebuilt(registry: &ToolRegistry, snapshot: &ConfigSnapshot) -> bool {
        registry
            .rebuild(
                &[(
                    "calc".to_string(),
                    Arc::new(vec![native_tool("add"), native_tool("sub")]),
                )],
                &[native_tool("workflow")],
                snapshot,
            )
            .await
    }

    #[tokio::test]
    async fn test_rebuild_and_lookup_totality() {
        let registry = ToolRegistry::new();
        let snapshot = ConfigSnapshot::default();
        assert!(rebuilt(&registry, &snapshot).await);

        // Every listed descriptor resolves to itself
        for descriptor in registry.list(ToolFilter::All).await {
            let looked_up = registry.lookup(&descriptor.name).await.unwrap();
            assert_eq!(looked_up.name, descriptor.name);
            assert_eq!(looked_up.owner, descriptor.owner);
        }

        let add = registry.lookup("calc__add").await.unwrap();
        assert_eq!(add.owner, "calc");
        assert_eq!(add.original_name, "add");
        assert!(add.enabled);

        let wf = registry.lookup("workflow").await.unwrap();
        assert_eq!(wf.owner, CUSTOM_OWNER);
    }

    #[tokio::test]
    async fn test_disabled_exclusion() {
        let registry = ToolRegistry::new();
        let snapshot = snapshot_with_disabled("calc", "add");
        rebuilt(&registry, &snapshot).await;

        let enabled = registry.list(ToolFilter::Enabled).await;
        assert!(enabled.iter().all(|t| t.name != "calc__add"));

        let disabled = registry.list(ToolFilter::Disabled).await;
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].name, "calc__add");

        let all = registry.list(ToolFilter::All).await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_change_detection() {
        let registry = ToolRegistry::new();
        let snapshot = ConfigSnapshot::default();

        assert!(rebuilt(&registry, &snapshot).await);
        // Identical rebuild: no change announced
        assert!(!rebuilt(&registry, &snapshot).await);
        // Flipping an enable flag is a visible change
        assert!(rebuilt(&registry, &snapshot_with_disabled("calc", "add")).await);
    }

    #[tokio::test]
    async fn test_usage_survives_rebuild() {
        let registry = ToolRegistry::new();
        let snapshot = ConfigSnapshot::default();
        rebuilt(&registry, &snapshot).await;

        registry.record_usage("calc__add").await;
        registry.record_usage("calc__add").await;

        // Catalog churn does not reset counters
        rebuilt(&registry, &snapshot_with_disabled("calc", "sub")).await;

        let add = registry.lookup("calc__add").await.unwrap();
        assert_eq!(add.usage_count, 2);
        assert!(add.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_name_discipline() {
        let registry = ToolRegistry::new();
        rebuilt(&registry, &ConfigSnapshot::default()).await;

        let all = registry.list(ToolFilter::All).await;
        let mut names: Vec<&str> = all.iter().map(|t| t.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), all.len());

        for t in &all {
            if t.owner != CUSTOM_OWNER {
                let (service, original) = t.name.split_once(NAME_SEPARATOR).unwrap();
                assert_eq!(service, t.owner);
                assert_eq!(original, t.original_name);
                // The prefix itself carries no underscore, so the
                // separator splits every flat name unambiguously
                assert!(!service.contains('_'));
            } else {
                assert!(!t.name.contains(NAME_SEPARATOR));
            }
        }
    }
}
