//! Service manager: supervises the downstream fleet and exposes the single
//! aggregation API the upstream sessions use.
//!
//! Ownership is strictly tree-shaped: the manager owns service handles,
//! each service task owns its transport. Events flow up a channel from
//! every service into one pump task, which keeps the registry current and
//! republishes on the bus.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

use conflux_config::{ConfigSnapshot, ServiceConfig};
use conflux_mcp::error::{McpError, McpResult};
use conflux_mcp::protocol::{Tool, ToolsCallResult};
use conflux_mcp::service::{McpService, McpServiceConfig, ServiceEvent, ServiceHandle};
use conflux_mcp::transport::{default_factory, TransportFactory};
use conflux_mcp::{BackoffPolicy, ServiceState};

use crate::audit::{AuditLog, AuditRecord};
use crate::custom::{CozeClient, CustomMcpConfig, CustomMcpHandler, WorkflowClient, CUSTOM_OWNER};
use crate::events::{EventBus, HubEvent};
use crate::registry::{ToolDescriptor, ToolFilter, ToolRegistry};

/// Manager-level tuning
#[derive(Clone)]
pub struct ServiceManagerConfig {
    /// Bound on `start()`: services still connecting when it expires keep
    /// connecting in the background
    pub start_deadline: Duration,

    pub audit_max_records: usize,

    /// Reconnection policy applied to every service
    pub backoff: BackoffPolicy,

    /// Liveness probing on established sessions; None disables
    pub heartbeat_interval: Option<Duration>,

    pub heartbeat_timeout: Duration,

    pub custom: CustomMcpConfig,

    /// Transport construction seam; tests swap in scripted transports
    pub transport_factory: TransportFactory,
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        Self {
            start_deadline: Duration::from_secs(30),
            audit_max_records: 1000,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: None,
            heartbeat_timeout: Duration::from_secs(10),
            custom: CustomMcpConfig::default(),
            transport_factory: default_factory(),
        }
    }
}

impl ServiceManagerConfig {
    /// Derive per-connection settings from the snapshot's connection block
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let connection = &snapshot.connection;
        Self {
            backoff: BackoffPolicy::default().with_initial(connection.reconnect_interval),
            heartbeat_interval: Some(connection.heartbeat_interval),
            heartbeat_timeout: connection.heartbeat_timeout,
            ..Self::default()
        }
    }
}

/// One supervised service
struct ManagedService {
    handle: ServiceHandle,
    config: ServiceConfig,
}

/// Point-in-time view of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,

    #[serde(rename = "toolCount")]
    pub tool_count: usize,

    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Point-in-time view of the whole hub
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub services: Vec<ServiceStatus>,

    #[serde(rename = "totalTools")]
    pub total_tools: usize,

    #[serde(rename = "auditRecords")]
    pub audit_records: usize,

    #[serde(rename = "auditDropped")]
    pub audit_dropped: u64,
}

pub struct ServiceManager {
    config: ServiceManagerConfig,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    services: RwLock<HashMap<String, ManagedService>>,
    registry: ToolRegistry,
    custom: RwLock<Arc<CustomMcpHandler>>,
    bus: EventBus,
    audit: AuditLog,
    event_tx: mpsc::Sender<ServiceEvent>,
}

impl ServiceManager {
    /// Build a manager over a resolved configuration snapshot. Custom
    /// tools are validated and advertised immediately; downstream services
    /// connect on `start()`.
    pub async fn new(
        snapshot: ConfigSnapshot,
        config: ServiceManagerConfig,
    ) -> McpResult<Arc<Self>> {
        let custom = build_custom_handler(&snapshot, &config)?;
        let (event_tx, event_rx) = mpsc::channel(256);

        let manager = Arc::new(Self {
            audit: AuditLog::new(config.audit_max_records),
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            services: RwLock::new(HashMap::new()),
            registry: ToolRegistry::new(),
            custom: RwLock::new(Arc::new(custom)),
            bus: EventBus::new(),
            event_tx,
        });

        tokio::spawn(Self::event_pump(Arc::downgrade(&manager), event_rx));
        manager.rebuild_registry().await;

        Ok(manager)
    }

    /// Connect every declared service. Returns once each has settled into
    /// `Ready` or `Failed`, bounded by the start deadline.
    pub async fn start(&self) -> McpResult<()> {
        let snapshot = self.snapshot.read().await.clone();
        let configs = snapshot.resolved_services()?;

        for service_config in configs {
            self.spawn_service(service_config).await;
        }

        let handles: Vec<ServiceHandle> = {
            let services = self.services.read().await;
            services.values().map(|s| s.handle.clone()).collect()
        };

        let settle = async {
            for handle in &handles {
                handle.wait_settled().await;
            }
        };
        if tokio::time::timeout(self.config.start_deadline, settle)
            .await
            .is_err()
        {
            tracing::warn!(
                deadline_secs = self.config.start_deadline.as_secs(),
                "start deadline elapsed with services still connecting"
            );
        }

        Ok(())
    }

    /// Close every service, cancel pending calls, flush the audit log
    pub async fn stop(&self) {
        let services: Vec<ServiceHandle> = {
            let mut map = self.services.write().await;
            map.drain().map(|(_, s)| s.handle).collect()
        };
        for handle in services {
            handle.stop().await;
        }

        self.custom.read().await.shutdown();
        self.audit.flush().await;
        self.rebuild_registry().await;
    }

    /// Apply a new configuration snapshot: stop removed services, start
    /// added ones, restart changed ones, refresh the synthetic tool set
    /// and the enable flags.
    pub async fn reload(&self, new_snapshot: ConfigSnapshot) -> McpResult<()> {
        let new_services = new_snapshot.resolved_services()?;
        new_snapshot.custom_tools()?;

        let old_snapshot = self.snapshot.read().await.clone();

        // Diff against the running set
        let mut to_stop: Vec<ServiceHandle> = Vec::new();
        let mut to_start: Vec<ServiceConfig> = Vec::new();
        {
            let mut running = self.services.write().await;

            let new_by_name: HashMap<&str, &ServiceConfig> =
                new_services.iter().map(|s| (s.name.as_str(), s)).collect();

            let removed: Vec<String> = running
                .keys()
                .filter(|name| !new_by_name.contains_key(name.as_str()))
                .cloned()
                .collect();
            for name in removed {
                if let Some(service) = running.remove(&name) {
                    tracing::info!(service = %name, "removing service");
                    to_stop.push(service.handle);
                }
            }

            for config in &new_services {
                match running.get(&config.name) {
                    Some(existing) if existing.config == *config => {}
                    Some(_) => {
                        tracing::info!(service = %config.name, "service changed, restarting");
                        if let Some(service) = running.remove(&config.name) {
                            to_stop.push(service.handle);
                        }
                        to_start.push(config.clone());
                    }
                    None => {
                        tracing::info!(service = %config.name, "adding service");
                        to_start.push(config.clone());
                    }
                }
            }
        }

        for handle in to_stop {
            handle.stop().await;
        }
        for config in to_start {
            self.spawn_service(config).await;
        }

        // Rebuild the workflow handler only when its inputs changed; a
        // rebuild drops the in-memory result cache.
        if old_snapshot.custom_mcp != new_snapshot.custom_mcp
            || old_snapshot.platforms != new_snapshot.platforms
        {
            let handler = build_custom_handler(&new_snapshot, &self.config)?;
            let old = {
                let mut slot = self.custom.write().await;
                std::mem::replace(&mut *slot, Arc::new(handler))
            };
            old.shutdown();
        }

        *self.snapshot.write().await = Arc::new(new_snapshot);
        self.rebuild_registry().await;

        Ok(())
    }

    /// Snapshot of the aggregate tool surface
    pub async fn list_tools(&self, filter: ToolFilter) -> Vec<ToolDescriptor> {
        self.registry.list(filter).await
    }

    /// Route one tool invocation to its owner.
    ///
    /// Disabled tools fail before any service is contacted; a service that
    /// is reconnecting fails immediately rather than queueing.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        deadline: Duration,
    ) -> McpResult<ToolsCallResult> {
        let started = Instant::now();
        let descriptor = self.registry.lookup(name).await;
        let owner = descriptor
            .as_ref()
            .map(|d| d.owner.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let result = self.dispatch(name, descriptor, &args, deadline).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Bookkeeping is best-effort and never fails the call
        if owner != "unknown" {
            self.registry.record_usage(name).await;
        }
        let error_text = result.as_ref().err().map(|e| e.to_string());
        self.audit.record(AuditRecord {
            tool: name.to_string(),
            server: owner,
            args,
            success: result.is_ok(),
            duration_ms,
            error: error_text.clone(),
            at: chrono::Utc::now(),
        });
        self.bus.publish(HubEvent::ToolCalled {
            name: name.to_string(),
            success: result.is_ok(),
            duration_ms,
            error: error_text,
        });

        result
    }

    async fn dispatch(
        &self,
        name: &str,
        descriptor: Option<ToolDescriptor>,
        args: &Value,
        deadline: Duration,
    ) -> McpResult<ToolsCallResult> {
        let descriptor = descriptor.ok_or_else(|| McpError::ToolNotFound {
            name: name.to_string(),
        })?;
        if !descriptor.enabled {
            return Err(McpError::ToolDisabled {
                name: name.to_string(),
            });
        }

        if descriptor.owner == CUSTOM_OWNER {
            let handler = self.custom.read().await.clone();
            return match tokio::time::timeout(deadline, handler.call(name, args)).await {
                Ok(result) => result,
                Err(_) => Err(McpError::Timeout { timeout: deadline }),
            };
        }

        let handle = {
            let services = self.services.read().await;
            services
                .get(&descriptor.owner)
                .map(|s| s.handle.clone())
                .ok_or_else(|| McpError::ServiceNotReady {
                    name: descriptor.owner.clone(),
                })?
        };

        handle
            .call_tool(&descriptor.original_name, args.clone(), deadline)
            .await
    }

    /// Per-service state plus aggregate counters
    pub async fn status(&self) -> ManagerStatus {
        let services = self.services.read().await;
        let mut statuses: Vec<ServiceStatus> = services
            .values()
            .map(|s| ServiceStatus {
                name: s.handle.name().to_string(),
                state: s.handle.state(),
                tool_count: s.handle.tools().len(),
                last_error: s.handle.last_error(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));

        ManagerStatus {
            services: statuses,
            total_tools: self.registry.len().await,
            audit_records: self.audit.len(),
            audit_dropped: self.audit.dropped(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    async fn spawn_service(&self, config: ServiceConfig) {
        let service_config = McpServiceConfig {
            name: config.name.clone(),
            backoff: self.config.backoff.clone(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
        };
        let handle = McpService::spawn(
            service_config,
            config.transport.clone(),
            self.config.transport_factory.clone(),
            self.event_tx.clone(),
        );

        self.services
            .write()
            .await
            .insert(config.name.clone(), ManagedService { handle, config });
    }

    /// Recompute the union view and announce a change when the surface
    /// actually moved.
    async fn rebuild_registry(&self) {
        let snapshot = self.snapshot.read().await.clone();

        // Last-known catalogs: a service that never reached Ready has an
        // empty one, and a reconnecting service keeps its previous catalog
        // so calls into the gap fail as not-ready rather than not-found.
        let native: Vec<(String, Arc<Vec<Tool>>)> = {
            let services = self.services.read().await;
            services
                .values()
                .map(|s| (s.handle.name().to_string(), s.handle.tools()))
                .collect()
        };
        let custom_tools = self.custom.read().await.tools();

        let changed = self
            .registry
            .rebuild(&native, &custom_tools, &snapshot)
            .await;
        if changed {
            self.bus.publish(HubEvent::ToolsListChanged);
        }
    }

    async fn event_pump(manager: Weak<Self>, mut events: mpsc::Receiver<ServiceEvent>) {
        while let Some(event) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match event {
                ServiceEvent::StateChanged { name, old, new } => {
                    tracing::debug!(service = %name, from = %old, to = %new, "service state changed");
                    manager.bus.publish(HubEvent::ServiceStateChanged {
                        name,
                        old,
                        new,
                    });
                    // Entering or leaving Ready moves tools in or out of
                    // the aggregate surface
                    if old.is_ready() || new.is_ready() {
                        manager.rebuild_registry().await;
                    }
                }
                ServiceEvent::ToolsChanged { name, .. } => {
                    tracing::debug!(service = %name, "service catalog changed");
                    manager.rebuild_registry().await;
                }
            }
        }
    }
}

fn build_custom_handler(
    snapshot: &ConfigSnapshot,
    config: &ServiceManagerConfig,
) -> McpResult<CustomMcpHandler> {
    let tools = snapshot.custom_tools()?.to_vec();

    let client: Option<Arc<dyn WorkflowClient>> = match &snapshot.platforms.coze.token {
        Some(token) if !token.is_empty() => Some(Arc::new(CozeClient::new(
            token.clone(),
            snapshot.platforms.coze.base_url.clone(),
        )?)),
        _ => None,
    };

    Ok(CustomMcpHandler::new(tools, client, config.custom.clone()))
}
