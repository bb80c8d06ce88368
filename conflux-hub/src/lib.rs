//! Aggregation layer for conflux.
//!
//! The [`manager::ServiceManager`] supervises the downstream service fleet,
//! owns the [`registry::ToolRegistry`] that merges every catalog into one
//! namespace, hosts the [`custom::CustomMcpHandler`] for workflow-backed
//! synthetic tools, and reports everything it does on the
//! [`events::EventBus`] and in the [`audit::AuditLog`].

pub mod audit;
pub mod custom;
pub mod events;
pub mod manager;
pub mod registry;

pub use audit::{AuditLog, AuditRecord};
pub use custom::{CozeClient, CustomMcpConfig, CustomMcpHandler, WorkflowClient, CUSTOM_OWNER};
pub use events::{EventBus, HubEvent};
pub use manager::{ManagerStatus, ServiceManager, ServiceManagerConfig, ServiceStatus};
pub use registry::{ToolDescriptor, ToolFilter, ToolRegistry};
