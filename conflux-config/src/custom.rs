//! CustomMCP tool definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{ConfigError, ConfigResult};

/// Handler backing a CustomMCP tool.
///
/// Only workflow proxying is supported; the platform field selects which
/// external workflow API receives the invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolHandlerConfig {
    #[serde(rename = "proxy")]
    Proxy {
        platform: String,

        #[serde(rename = "workflowId")]
        workflow_id: String,
    },
}

/// One synthetic tool advertised by the CustomMCP handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,

    pub handler: ToolHandlerConfig,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl CustomToolConfig {
    /// Workflow id for proxy handlers
    pub fn workflow_id(&self) -> &str {
        match &self.handler {
            ToolHandlerConfig::Proxy { workflow_id, .. } => workflow_id,
        }
    }

    pub fn platform(&self) -> &str {
        match &self.handler {
            ToolHandlerConfig::Proxy { platform, .. } => platform,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidCustomTool {
                name: self.name.clone(),
                message: "name cannot be empty".to_string(),
            });
        }
        // Native tools are namespaced "<service>__<original>"; a custom name
        // containing the separator could collide with that namespace.
        if self.name.contains("__") {
            return Err(ConfigError::InvalidCustomTool {
                name: self.name.clone(),
                message: "name must not contain the '__' namespace separator".to_string(),
            });
        }
        match &self.handler {
            ToolHandlerConfig::Proxy {
                platform,
                workflow_id,
            } => {
                if platform != "coze" {
                    return Err(ConfigError::InvalidCustomTool {
                        name: self.name.clone(),
                        message: format!("unsupported platform '{}'", platform),
                    });
                }
                if workflow_id.is_empty() {
                    return Err(ConfigError::InvalidCustomTool {
                        name: self.name.clone(),
                        message: "workflowId cannot be empty".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validate a full tool set: each entry individually plus name uniqueness.
pub fn validate_tool_set(tools: &[CustomToolConfig]) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for tool in tools {
        tool.validate()?;
        if !seen.insert(tool.name.as_str()) {
            return Err(ConfigError::InvalidCustomTool {
                name: tool.name.clone(),
                message: "duplicate tool name".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> CustomToolConfig {
        CustomToolConfig {
            name: name.to_string(),
            description: "a workflow tool".to_string(),
            input_schema: default_schema(),
            handler: ToolHandlerConfig::Proxy {
                platform: "coze".to_string(),
                workflow_id: "wf-1".to_string(),
            },
        }
    }

    #[test]
    fn test_valid_tool() {
        assert!(tool("summarize").validate().is_ok());
    }

    #[test]
    fn test_namespace_separator_rejected() {
        let err = tool("svc__evil").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCustomTool { .. }));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let mut t = tool("summarize");
        t.handler = ToolHandlerConfig::Proxy {
            platform: "dify".to_string(),
            workflow_id: "wf-1".to_string(),
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let set = vec![tool("a"), tool("b"), tool("a")];
        assert!(validate_tool_set(&set).is_err());
        assert!(validate_tool_set(&set[..2]).is_ok());
    }

    #[test]
    fn test_deserialization_defaults() {
        let t: CustomToolConfig = serde_json::from_value(serde_json::json!({
            "name": "slow",
            "handler": { "type": "proxy", "platform": "coze", "workflowId": "wf-9" }
        }))
        .unwrap();
        assert_eq!(t.workflow_id(), "wf-9");
        assert_eq!(t.input_schema["type"], "object");
    }
}
