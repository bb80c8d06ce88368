//! Configuration model consumed by the conflux core.
//!
//! This crate defines the *resolved* configuration snapshot: the shape the
//! aggregation core works against after the external storage layer has
//! loaded, migrated and merged whatever file format it owns. Nothing here
//! reads files or watches for changes.

pub mod custom;
pub mod error;
pub mod service;
pub mod snapshot;

pub use custom::{CustomToolConfig, ToolHandlerConfig};
pub use error::{ConfigError, ConfigResult};
pub use service::{ServiceConfig, ServiceDecl, TransportKind, MODELSCOPE_HOST};
pub use snapshot::{
    ConfigSnapshot, ConnectionConfig, CozeConfig, OneOrMany, ServerToolConfig, ToolOverride,
};
