//! Downstream service declarations and transport resolution

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};

/// Host that identifies a ModelScope-hosted MCP endpoint. Connections to
/// this host require bearer credentials.
pub const MODELSCOPE_HOST: &str = "mcp.api-inference.modelscope.net";

/// Environment variable consulted as the last resort for ModelScope credentials.
pub const MODELSCOPE_TOKEN_ENV: &str = "MODELSCOPE_API_TOKEN";

/// Resolved transport configuration for one downstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport")]
pub enum TransportKind {
    /// Local child process speaking NDJSON over stdin/stdout
    #[serde(rename = "stdio")]
    Stdio {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// Single HTTP endpoint; responses may be JSON or an event stream
    #[serde(rename = "streamable-http")]
    StreamableHttp {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },

    /// Server-Sent Events stream paired with a discovered POST endpoint
    #[serde(rename = "sse")]
    Sse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },

    /// SSE against a ModelScope host; bearer credentials are mandatory
    #[serde(rename = "modelscope-sse")]
    ModelScopeSse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

impl TransportKind {
    /// Transport name as written in configuration
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::StreamableHttp { .. } => "streamable-http",
            TransportKind::Sse { .. } => "sse",
            TransportKind::ModelScopeSse { .. } => "modelscope-sse",
        }
    }

    /// Remote URL for network transports
    pub fn url(&self) -> Option<&str> {
        match self {
            TransportKind::Stdio { .. } => None,
            TransportKind::StreamableHttp { url, .. }
            | TransportKind::Sse { url, .. }
            | TransportKind::ModelScopeSse { url, .. } => Some(url),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            TransportKind::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ConfigError::InvalidService {
                        name: String::new(),
                        message: "stdio transport command cannot be empty".to_string(),
                    });
                }
            }
            TransportKind::StreamableHttp { url, .. }
            | TransportKind::Sse { url, .. }
            | TransportKind::ModelScopeSse { url, .. } => {
                let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                match parsed.scheme() {
                    "http" | "https" => {}
                    scheme => {
                        return Err(ConfigError::InvalidUrl {
                            url: url.clone(),
                            reason: format!("unsupported scheme '{}'", scheme),
                        })
                    }
                }
            }
        }
        Ok(())
    }
}

/// Declarative service entry as it appears in the `mcpServers` map.
///
/// The transport tag is optional: when absent it is inferred from the
/// fields present (`command` means stdio, a URL is classified by its path
/// and host).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ServiceDecl {
    /// Resolve this declaration into a concrete transport.
    ///
    /// `modelscope_key` is the process-global fallback consulted after the
    /// per-service `apiKey`; the environment is the last resort. ModelScope
    /// targets with no credentials anywhere fail fast here rather than at
    /// connect time.
    pub fn resolve(&self, name: &str, modelscope_key: Option<&str>) -> ConfigResult<ServiceConfig> {
        validate_service_name(name)?;

        let kind = if let Some(command) = &self.command {
            match self.transport.as_deref() {
                None | Some("stdio") => TransportKind::Stdio {
                    command: command.clone(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                },
                Some(other) => {
                    return Err(ConfigError::invalid_service(
                        name,
                        format!("transport '{}' cannot be combined with a command", other),
                    ))
                }
            }
        } else if let Some(url) = &self.url {
            self.classify_url(name, self.transport.as_deref(), url, modelscope_key)?
        } else if self.transport.as_deref() == Some("stdio") {
            return Err(ConfigError::invalid_service(
                name,
                "stdio transport requires a command",
            ));
        } else {
            return Err(ConfigError::invalid_service(
                name,
                "either a command or a url is required",
            ));
        };

        kind.validate().map_err(|e| match e {
            ConfigError::InvalidService { message, .. } => {
                ConfigError::invalid_service(name, message)
            }
            other => other,
        })?;

        Ok(ServiceConfig {
            name: name.to_string(),
            transport: kind,
        })
    }

    fn classify_url(
        &self,
        name: &str,
        tag: Option<&str>,
        url: &str,
        modelscope_key: Option<&str>,
    ) -> ConfigResult<TransportKind> {
        let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let is_modelscope = parsed.host_str() == Some(MODELSCOPE_HOST);

        let resolved_tag = match tag {
            Some(t) => t.to_string(),
            None if is_modelscope => "modelscope-sse".to_string(),
            None if parsed.path().trim_end_matches('/').ends_with("/sse") => "sse".to_string(),
            None => "streamable-http".to_string(),
        };

        match resolved_tag.as_str() {
            "stdio" => Err(ConfigError::invalid_service(
                name,
                "stdio transport requires a command",
            )),
            "streamable-http" => Ok(TransportKind::StreamableHttp {
                url: url.to_string(),
                headers: self.headers.clone(),
                api_key: self.api_key.clone(),
            }),
            "sse" => Ok(TransportKind::Sse {
                url: url.to_string(),
                headers: self.headers.clone(),
                api_key: self.api_key.clone(),
            }),
            "modelscope-sse" => {
                let key = resolve_modelscope_key(self.api_key.as_deref(), modelscope_key)?;
                Ok(TransportKind::ModelScopeSse {
                    url: url.to_string(),
                    headers: self.headers.clone(),
                    api_key: Some(key),
                })
            }
            other => Err(ConfigError::invalid_service(
                name,
                format!("unknown transport '{}'", other),
            )),
        }
    }
}

/// Fully resolved configuration for one downstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportKind,
}

/// Service names become the prefix of `"<service>__<tool>"` flat names.
/// The `__` separator means the prefix itself cannot contain underscores,
/// or the separator would no longer split a flat name unambiguously.
pub fn validate_service_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::InvalidServiceName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ConfigError::InvalidServiceName {
            name: name.to_string(),
            reason: "only [A-Za-z0-9-] is allowed".to_string(),
        });
    }
    Ok(())
}

/// Resolve ModelScope bearer credentials: service config first, then the
/// process-global setting, then the environment.
pub fn resolve_modelscope_key(
    service_key: Option<&str>,
    global_key: Option<&str>,
) -> ConfigResult<String> {
    if let Some(key) = service_key.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    if let Some(key) = global_key.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    if let Ok(key) = std::env::var(MODELSCOPE_TOKEN_ENV) {
        if !key.is_empty() {
            return Ok(key);
        }
    }
    Err(ConfigError::missing_credentials(format!(
        "ModelScope endpoint requires a bearer token (set apiKey, modelscope.apiKey, or {})",
        MODELSCOPE_TOKEN_ENV
    )))
}
