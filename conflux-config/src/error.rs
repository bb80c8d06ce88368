//! Configuration error types

use thiserror::Error;

/// Result type for configuration validation and resolution
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while validating or resolving a configuration snapshot.
///
/// These are never retried: a snapshot either resolves cleanly or the
/// offending entry is surfaced once and skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid service name '{name}': {reason}")]
    InvalidServiceName { name: String, reason: String },

    #[error("service '{name}': {message}")]
    InvalidService { name: String, message: String },

    #[error("custom tool '{name}': {message}")]
    InvalidCustomTool { name: String, message: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("missing credentials: {message}")]
    MissingCredentials { message: String },
}

impl ConfigError {
    pub fn invalid_service(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidService {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn missing_credentials(message: impl Into<String>) -> Self {
        Self::MissingCredentials {
            message: message.into(),
        }
    }
}
