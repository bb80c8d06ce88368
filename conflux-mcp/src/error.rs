//! Error types shared across the proxy core

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Error taxonomy for the proxy core.
///
/// Every failure a caller can observe is one of these kinds; `kind()` is
/// the stable string carried in JSON-RPC `error.data.kind` toward upstream
/// agents.
#[derive(Error, Debug)]
pub enum McpError {
    /// Malformed or insufficient configuration. Never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Transport could not be established. Retried per backoff.
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Transport requires credentials that were not supplied. Not retried.
    #[error("authorization required: {message}")]
    AuthRequired { message: String },

    /// MCP initialize did not complete
    #[error("handshake failed: {message}")]
    HandshakeFailed { message: String },

    /// A frame from the remote was not a well-formed JSON-RPC message
    #[error("malformed frame: {details}")]
    FrameParse { details: String },

    /// The underlying channel closed while a call was outstanding
    #[error("channel closed: {message}")]
    ChannelClosed { message: String },

    /// Well-formed JSON-RPC that violates the MCP dialect
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("tool disabled: {name}")]
    ToolDisabled { name: String },

    /// The owning service is not in the Ready state
    #[error("service not ready: {name}")]
    ServiceNotReady { name: String },

    /// The remote returned a JSON-RPC error response, passed through unchanged
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A CustomMCP workflow entry exceeded the stall threshold
    #[error("task stalled: {task_id}")]
    TaskStalled { task_id: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl McpError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::AuthRequired {
            message: message.into(),
        }
    }

    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }

    pub fn frame_parse(details: impl Into<String>) -> Self {
        Self::FrameParse {
            details: details.into(),
        }
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable identifier for this error kind, carried in `error.data.kind`
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::Configuration { .. } => "config",
            McpError::ConnectionFailed { .. } => "connect",
            McpError::AuthRequired { .. } => "auth_required",
            McpError::HandshakeFailed { .. } => "handshake_failed",
            McpError::FrameParse { .. } => "frame_parse",
            McpError::ChannelClosed { .. } => "channel_closed",
            McpError::Protocol { .. } => "protocol",
            McpError::ToolNotFound { .. } => "tool_not_found",
            McpError::ToolDisabled { .. } => "tool_disabled",
            McpError::ServiceNotReady { .. } => "service_not_ready",
            McpError::Remote { .. } => "remote",
            McpError::Timeout { .. } => "timeout",
            McpError::TaskStalled { .. } => "task_stalled",
            McpError::Internal { .. } => "internal",
        }
    }

    /// Whether a reconnection attempt can help
    pub fn is_retryable(&self) -> bool {
        match self {
            McpError::ConnectionFailed { .. }
            | McpError::HandshakeFailed { .. }
            | McpError::ChannelClosed { .. }
            | McpError::Timeout { .. } => true,

            McpError::Configuration { .. }
            | McpError::AuthRequired { .. }
            | McpError::ToolNotFound { .. }
            | McpError::ToolDisabled { .. }
            | McpError::FrameParse { .. } => false,

            _ => false,
        }
    }

    /// JSON-RPC error code for upstream responses
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            McpError::ToolNotFound { .. } | McpError::ToolDisabled { .. } => -32602,
            McpError::FrameParse { .. } => -32700,
            McpError::Protocol { .. } => -32600,
            _ => -32000,
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::FrameParse {
            details: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else {
            McpError::ConnectionFailed {
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected => McpError::ConnectionFailed {
                message: err.to_string(),
            },
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                McpError::ChannelClosed {
                    message: err.to_string(),
                }
            }
            _ => McpError::ConnectionFailed {
                message: err.to_string(),
            },
        }
    }
}

impl From<conflux_config::ConfigError> for McpError {
    fn from(err: conflux_config::ConfigError) -> Self {
        match err {
            conflux_config::ConfigError::MissingCredentials { message } => {
                McpError::AuthRequired { message }
            }
            other => McpError::Configuration {
                message: other.to_string(),
            },
        }
    }
}
