//! Downstream MCP service client.
//!
//! One [`McpService`] wraps one transport and runs as its own task: it
//! performs the initialize handshake, caches the remote tool catalog,
//! correlates outbound request ids against a pending map, and reconnects
//! with backoff when the transport drops. Callers hold a [`ServiceHandle`];
//! commands flow down a channel, events flow up another.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

use conflux_config::TransportKind;

use crate::error::{McpError, McpResult};
use crate::protocol::{
    catalog_hash, methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallResult, ToolsListResult,
    MCP_PROTOCOL_VERSION,
};
use crate::reconnect::BackoffPolicy;
use crate::transport::{Transport, TransportFactory};

/// Lifecycle of a downstream service. Only `Ready` services contribute
/// tools to the aggregate surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    Stopping,
    Failed,
}

impl ServiceState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceState::Ready)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Disconnected => "disconnected",
            ServiceState::Connecting => "connecting",
            ServiceState::Handshaking => "handshaking",
            ServiceState::Ready => "ready",
            ServiceState::Reconnecting => "reconnecting",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events a service task reports to its owner
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    StateChanged {
        name: String,
        old: ServiceState,
        new: ServiceState,
    },
    ToolsChanged {
        name: String,
        tools: Arc<Vec<Tool>>,
    },
}

/// Tuning for one service task
#[derive(Debug, Clone)]
pub struct McpServiceConfig {
    pub name: String,

    pub backoff: BackoffPolicy,

    /// Budget for the initialize + tools/list sequence
    pub handshake_timeout: Duration,

    /// JSON-RPC ping probe cadence on an established session; None disables
    pub heartbeat_interval: Option<Duration>,

    /// How long a probe may remain unanswered before the session is
    /// declared dead
    pub heartbeat_timeout: Duration,
}

impl McpServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff: BackoffPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

enum Command {
    Call {
        tool: String,
        args: Value,
        deadline: Duration,
        reply: oneshot::Sender<McpResult<ToolsCallResult>>,
    },
    Refresh,
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Caller-side handle to a running service task
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ServiceState>,
    tools_rx: watch::Receiver<Arc<Vec<Tool>>>,
    last_error_rx: watch::Receiver<Option<String>>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Last known tool catalog; kept across reconnects
    pub fn tools(&self) -> Arc<Vec<Tool>> {
        self.tools_rx.borrow().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error_rx.borrow().clone()
    }

    /// Invoke a tool by its name as known to the remote.
    ///
    /// Fails immediately with `ServiceNotReady` unless the service is
    /// `Ready`; there is no queuing across reconnects.
    pub async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        deadline: Duration,
    ) -> McpResult<ToolsCallResult> {
        if !self.state().is_ready() {
            return Err(McpError::ServiceNotReady {
                name: self.name.clone(),
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                tool: tool.to_string(),
                args,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| McpError::ServiceNotReady {
                name: self.name.clone(),
            })?;

        // The task enforces the deadline; the guard below only covers a
        // wedged task so no caller ever waits unbounded.
        match tokio::time::timeout(deadline + Duration::from_secs(2), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::channel_closed("service task dropped the call")),
            Err(_) => Err(McpError::Timeout { timeout: deadline }),
        }
    }

    /// Ask the task to refetch the remote tool catalog
    pub async fn refresh(&self) {
        let _ = self.cmd_tx.send(Command::Refresh).await;
    }

    /// Stop the service and wait for its transport to close
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Stop { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Wait until the service reaches `Ready` or `Failed`
    pub async fn wait_settled(&self) -> ServiceState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if matches!(state, ServiceState::Ready | ServiceState::Failed) {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Spawns service tasks
pub struct McpService;

impl McpService {
    /// Spawn the task for one configured service. The factory builds the
    /// transport fresh on every reconnect attempt.
    pub fn spawn(
        config: McpServiceConfig,
        kind: TransportKind,
        factory: TransportFactory,
        events: mpsc::Sender<ServiceEvent>,
    ) -> ServiceHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ServiceState::Disconnected);
        let (tools_tx, tools_rx) = watch::channel(Arc::new(Vec::new()));
        let (last_error_tx, last_error_rx) = watch::channel(None);

        let handle = ServiceHandle {
            name: config.name.clone(),
            cmd_tx,
            state_rx,
            tools_rx,
            last_error_rx,
        };

        let task = ServiceTask {
            config,
            kind,
            factory,
            events,
            cmd_rx,
            state_tx,
            tools_tx,
            last_error_tx,
            next_id: 1,
            catalog_hash: None,
        };
        tokio::spawn(task.run());

        handle
    }
}

enum PendingKind {
    Call(oneshot::Sender<McpResult<ToolsCallResult>>),
    ToolsList,
    Ping,
}

struct PendingEntry {
    kind: PendingKind,
    expires_at: Instant,
}

enum SessionEnd {
    Stopped,
    Disconnected(McpError),
}

struct ServiceTask {
    config: McpServiceConfig,
    kind: TransportKind,
    factory: TransportFactory,
    events: mpsc::Sender<ServiceEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ServiceState>,
    tools_tx: watch::Sender<Arc<Vec<Tool>>>,
    last_error_tx: watch::Sender<Option<String>>,
    next_id: i64,
    catalog_hash: Option<String>,
}

impl ServiceTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ServiceState::Connecting).await;

            let transport = match (self.factory)(&self.kind) {
                Ok(t) => t,
                Err(e) => {
                    // Factory failures are configuration-level; no retry.
                    tracing::error!(service = %self.config.name, error = %e, "transport construction failed");
                    self.record_error(&e);
                    self.set_state(ServiceState::Failed).await;
                    self.park().await;
                    return;
                }
            };

            match self.connect_and_handshake(transport).await {
                Ok((transport, tools)) => {
                    attempt = 0;
                    self.last_error_tx.send_replace(None);
                    self.install_catalog(tools).await;
                    self.set_state(ServiceState::Ready).await;

                    match self.session(transport).await {
                        SessionEnd::Stopped => {
                            self.set_state(ServiceState::Disconnected).await;
                            return;
                        }
                        SessionEnd::Disconnected(e) => {
                            tracing::warn!(service = %self.config.name, error = %e, "session ended");
                            self.record_error(&e);
                        }
                    }
                }
                Err(e) => {
                    if !e.is_retryable() {
                        tracing::error!(service = %self.config.name, error = %e, "unrecoverable connect error");
                        self.record_error(&e);
                        self.set_state(ServiceState::Failed).await;
                        self.park().await;
                        return;
                    }
                    tracing::warn!(service = %self.config.name, error = %e, "connect failed");
                    self.record_error(&e);
                }
            }

            attempt += 1;
            if self.config.backoff.is_exhausted(attempt) {
                tracing::error!(
                    service = %self.config.name,
                    attempts = attempt,
                    "giving up after repeated connect failures"
                );
                self.set_state(ServiceState::Failed).await;
                self.park().await;
                return;
            }

            self.set_state(ServiceState::Reconnecting).await;
            let delay = self.config.backoff.delay_for(attempt);
            tracing::info!(
                service = %self.config.name,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            if self.backoff_wait(delay).await {
                self.set_state(ServiceState::Disconnected).await;
                return;
            }
        }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn set_state(&mut self, new: ServiceState) {
        let old = *self.state_tx.borrow();
        if old == new {
            return;
        }
        self.state_tx.send_replace(new);
        let _ = self
            .events
            .send(ServiceEvent::StateChanged {
                name: self.config.name.clone(),
                old,
                new,
            })
            .await;
    }

    fn record_error(&self, error: &McpError) {
        self.last_error_tx.send_replace(Some(error.to_string()));
    }

    async fn install_catalog(&mut self, tools: Vec<Tool>) {
        let hash = catalog_hash(&tools);
        if self.catalog_hash.as_deref() == Some(hash.as_str()) {
            return;
        }
        self.catalog_hash = Some(hash);
        let tools = Arc::new(tools);
        self.tools_tx.send_replace(tools.clone());
        let _ = self
            .events
            .send(ServiceEvent::ToolsChanged {
                name: self.config.name.clone(),
                tools,
            })
            .await;
    }

    /// Connect the transport, run initialize/initialized, fetch the
    /// initial catalog.
    async fn connect_and_handshake(
        &mut self,
        mut transport: Box<dyn Transport>,
    ) -> McpResult<(Box<dyn Transport>, Vec<Tool>)> {
        transport.connect().await?;
        self.set_state(ServiceState::Handshaking).await;

        let deadline = Instant::now() + self.config.handshake_timeout;

        let init_id = self.next_id();
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Some(ClientInfo {
                name: "conflux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        };
        let request = JsonRpcRequest::with_id(
            methods::INITIALIZE,
            Some(serde_json::to_value(&params).map_err(|e| McpError::internal(e.to_string()))?),
            init_id,
        );
        transport.send(request.into()).await?;

        let result = await_response(transport.as_mut(), init_id, deadline)
            .await
            .map_err(|e| McpError::handshake_failed(format!("initialize: {}", e)))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::handshake_failed(format!("bad initialize result: {}", e)))?;
        tracing::debug!(
            service = %self.config.name,
            protocol = %init.protocol_version,
            "handshake complete"
        );

        transport
            .send(JsonRpcRequest::notification(methods::INITIALIZED, None).into())
            .await?;

        let list_id = self.next_id();
        transport
            .send(JsonRpcRequest::with_id(methods::TOOLS_LIST, None, list_id).into())
            .await?;
        let result = await_response(transport.as_mut(), list_id, deadline)
            .await
            .map_err(|e| McpError::handshake_failed(format!("tools/list: {}", e)))?;
        let listing: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::handshake_failed(format!("bad tools/list result: {}", e)))?;

        tracing::info!(
            service = %self.config.name,
            tool_count = listing.tools.len(),
            "service ready"
        );

        Ok((transport, listing.tools))
    }

    /// Established-session loop: dispatch commands, correlate responses,
    /// expire deadlines, probe liveness.
    async fn session(&mut self, mut transport: Box<dyn Transport>) -> SessionEnd {
        let mut pending: HashMap<i64, PendingEntry> = HashMap::new();

        let mut sweep = tokio::time::interval(Duration::from_millis(100));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let heartbeat_period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval(
            heartbeat_period.unwrap_or(Duration::from_secs(3600)),
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset(); // skip the immediate first tick

        enum Step {
            Cmd(Option<Command>),
            Incoming(McpResult<JsonRpcMessage>),
            Sweep,
            Heartbeat,
        }

        loop {
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                msg = transport.receive() => Step::Incoming(msg),
                _ = sweep.tick() => Step::Sweep,
                _ = heartbeat.tick(), if heartbeat_period.is_some() => Step::Heartbeat,
            };

            match step {
                Step::Cmd(None) => {
                    // Every handle dropped: shut down quietly
                    fail_all(&mut pending, || McpError::channel_closed("service stopping"));
                    let _ = transport.close().await;
                    return SessionEnd::Stopped;
                }
                Step::Cmd(Some(Command::Stop { reply })) => {
                    self.set_state(ServiceState::Stopping).await;
                    fail_all(&mut pending, || McpError::channel_closed("service stopping"));
                    let _ = transport.close().await;
                    self.set_state(ServiceState::Disconnected).await;
                    let _ = reply.send(());
                    return SessionEnd::Stopped;
                }
                Step::Cmd(Some(Command::Call {
                    tool,
                    args,
                    deadline,
                    reply,
                })) => {
                    let id = self.next_id();
                    let request = JsonRpcRequest::with_id(
                        methods::TOOLS_CALL,
                        Some(json!({ "name": tool, "arguments": args })),
                        id,
                    );
                    match transport.send(request.into()).await {
                        Ok(()) => {
                            pending.insert(
                                id,
                                PendingEntry {
                                    kind: PendingKind::Call(reply),
                                    expires_at: Instant::now() + deadline,
                                },
                            );
                        }
                        Err(e) => {
                            let _ = reply.send(Err(McpError::channel_closed(e.to_string())));
                            fail_all(&mut pending, || {
                                McpError::channel_closed("transport send failed")
                            });
                            return SessionEnd::Disconnected(e);
                        }
                    }
                }
                Step::Cmd(Some(Command::Refresh)) => {
                    if let Err(e) = self.send_tools_list(transport.as_mut(), &mut pending).await {
                        tracing::warn!(service = %self.config.name, error = %e, "catalog refresh failed");
                    }
                }
                Step::Incoming(Ok(JsonRpcMessage::Response(response))) => {
                    self.handle_response(response, &mut pending).await;
                }
                Step::Incoming(Ok(JsonRpcMessage::Request(request))) => {
                    self.handle_remote_request(request, transport.as_mut(), &mut pending)
                        .await;
                }
                Step::Incoming(Err(e)) => {
                    fail_all(&mut pending, || McpError::channel_closed("service disconnected"));
                    let _ = transport.close().await;
                    return SessionEnd::Disconnected(e);
                }
                Step::Sweep => {
                    let now = Instant::now();
                    let expired: Vec<i64> = pending
                        .iter()
                        .filter(|(_, entry)| entry.expires_at <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in expired {
                        let Some(entry) = pending.remove(&id) else { continue };
                        match entry.kind {
                            PendingKind::Call(reply) => {
                                let _ = reply.send(Err(McpError::Timeout {
                                    timeout: Duration::ZERO,
                                }));
                                // Best-effort cancellation toward the remote
                                let cancel = JsonRpcRequest::notification(
                                    methods::CANCEL_REQUEST,
                                    Some(json!({ "id": id })),
                                );
                                let _ = transport.send(cancel.into()).await;
                            }
                            PendingKind::ToolsList => {
                                tracing::warn!(service = %self.config.name, "catalog refresh timed out");
                            }
                            PendingKind::Ping => {
                                // A dead probe means a dead session
                                fail_all(&mut pending, || {
                                    McpError::channel_closed("heartbeat timed out")
                                });
                                let _ = transport.close().await;
                                return SessionEnd::Disconnected(McpError::Timeout {
                                    timeout: self.config.heartbeat_timeout,
                                });
                            }
                        }
                    }
                }
                Step::Heartbeat => {
                    let id = self.next_id();
                    let ping = JsonRpcRequest::with_id(methods::PING, None, id);
                    match transport.send(ping.into()).await {
                        Ok(()) => {
                            pending.insert(
                                id,
                                PendingEntry {
                                    kind: PendingKind::Ping,
                                    expires_at: Instant::now() + self.config.heartbeat_timeout,
                                },
                            );
                        }
                        Err(e) => {
                            fail_all(&mut pending, || {
                                McpError::channel_closed("transport send failed")
                            });
                            return SessionEnd::Disconnected(e);
                        }
                    }
                }
            }
        }
    }

    async fn send_tools_list(
        &mut self,
        transport: &mut dyn Transport,
        pending: &mut HashMap<i64, PendingEntry>,
    ) -> McpResult<()> {
        let id = self.next_id();
        transport
            .send(JsonRpcRequest::with_id(methods::TOOLS_LIST, None, id).into())
            .await?;
        pending.insert(
            id,
            PendingEntry {
                kind: PendingKind::ToolsList,
                expires_at: Instant::now() + self.config.handshake_timeout,
            },
        );
        Ok(())
    }

    async fn handle_response(
        &mut self,
        response: JsonRpcResponse,
        pending: &mut HashMap<i64, PendingEntry>,
    ) {
        let Some(id) = response.id.as_ref().and_then(Value::as_i64) else {
            tracing::debug!(service = %self.config.name, "response without numeric id, dropping");
            return;
        };
        let Some(entry) = pending.remove(&id) else {
            tracing::debug!(service = %self.config.name, id = id, "response for unknown id");
            return;
        };

        match entry.kind {
            PendingKind::Call(reply) => {
                let result = response.into_result().and_then(|value| {
                    serde_json::from_value::<ToolsCallResult>(value)
                        .map_err(|e| McpError::protocol(format!("bad tools/call result: {}", e)))
                });
                let _ = reply.send(result);
            }
            PendingKind::ToolsList => match response.into_result() {
                Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                    Ok(listing) => self.install_catalog(listing.tools).await,
                    Err(e) => {
                        // Keep the last known catalog on refresh failures
                        tracing::warn!(service = %self.config.name, error = %e, "bad tools/list result");
                    }
                },
                Err(e) => {
                    tracing::warn!(service = %self.config.name, error = %e, "catalog refresh rejected");
                }
            },
            PendingKind::Ping => {
                tracing::trace!(service = %self.config.name, "pong");
            }
        }
    }

    async fn handle_remote_request(
        &mut self,
        request: JsonRpcRequest,
        transport: &mut dyn Transport,
        pending: &mut HashMap<i64, PendingEntry>,
    ) {
        match request.method.as_str() {
            methods::TOOLS_LIST_CHANGED => {
                tracing::debug!(service = %self.config.name, "remote announced tool change");
                if let Err(e) = self.send_tools_list(transport, pending).await {
                    tracing::warn!(service = %self.config.name, error = %e, "catalog refresh failed");
                }
            }
            methods::PING if request.id.is_some() => {
                let response = JsonRpcResponse::success(json!({}), request.id);
                let _ = transport.send(response.into()).await;
            }
            _ if request.is_notification() => {
                tracing::debug!(
                    service = %self.config.name,
                    method = %request.method,
                    "ignoring notification"
                );
            }
            other => {
                let response = JsonRpcResponse::error(
                    crate::protocol::JsonRpcError::method_not_found(other),
                    request.id,
                );
                let _ = transport.send(response.into()).await;
            }
        }
    }

    /// Sleep out a backoff delay while still answering commands.
    /// Returns true when a stop was requested.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return true,
                    Some(Command::Stop { reply }) => {
                        self.set_state(ServiceState::Disconnected).await;
                        let _ = reply.send(());
                        return true;
                    }
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(McpError::ServiceNotReady {
                            name: self.config.name.clone(),
                        }));
                    }
                    Some(Command::Refresh) => {}
                },
            }
        }
    }

    /// Terminal `Failed` parking: answer commands until stopped
    async fn park(&mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Stop { reply } => {
                    self.set_state(ServiceState::Disconnected).await;
                    let _ = reply.send(());
                    return;
                }
                Command::Call { reply, .. } => {
                    let _ = reply.send(Err(McpError::ServiceNotReady {
                        name: self.config.name.clone(),
                    }));
                }
                Command::Refresh => {}
            }
        }
    }
}

fn fail_all(pending: &mut HashMap<i64, PendingEntry>, error: impl Fn() -> McpError) {
    for (_, entry) in pending.drain() {
        if let PendingKind::Call(reply) = entry.kind {
            let _ = reply.send(Err(error()));
        }
    }
}

/// Sequential response wait used during the handshake, before the session
/// loop owns correlation. Frames for other ids or notifications are
/// logged and skipped.
async fn await_response(
    transport: &mut dyn Transport,
    id: i64,
    deadline: Instant,
) -> McpResult<Value> {
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(McpError::Timeout {
                timeout: Duration::ZERO,
            })?;

        let message = tokio::time::timeout(remaining, transport.receive())
            .await
            .map_err(|_| McpError::Timeout { timeout: remaining })??;

        match message {
            JsonRpcMessage::Response(response)
                if response.id.as_ref().and_then(Value::as_i64) == Some(id) =>
            {
                return response.into_result();
            }
            other => {
                tracing::debug!("skipping out-of-band frame during handshake: {:?}", other.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool, ScriptedRemote};

    fn test_config(name: &str) -> McpServiceConfig {
        McpServiceConfig {
            backoff: BackoffPolicy {
                initial: Some(Duration::from_millis(10)),
                multiplier: 1.5,
                cap: Duration::from_millis(100),
                max_attempts: Some(3),
                jitter: 0.0,
            },
            handshake_timeout: Duration::from_secs(2),
            ..McpServiceConfig::new(name)
        }
    }

    fn stdio_kind() -> TransportKind {
        TransportKind::Stdio {
            command: "unused".to_string(),
            args: vec![],
            env: Default::default(),
        }
    }

    fn spawn_scripted(
        name: &str,
        remote: &ScriptedRemote,
    ) -> (ServiceHandle, mpsc::Receiver<ServiceEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = McpService::spawn(test_config(name), stdio_kind(), remote.factory(), event_tx);
        (handle, event_rx)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready_and_caches_tools() {
        let remote = ScriptedRemote::echoing(vec![tool("add", "adds two integers")]);
        let (handle, _events) = spawn_scripted("calc", &remote);

        assert_eq!(handle.wait_settled().await, ServiceState::Ready);
        let tools = handle.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "add");

        handle.stop().await;
        assert_eq!(handle.state(), ServiceState::Disconnected);
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let remote = ScriptedRemote::echoing(vec![tool("add", "")]);
        let (handle, _events) = spawn_scripted("calc", &remote);
        handle.wait_settled().await;

        let result = handle
            .call_tool("add", json!({"a": 2, "b": 3}), Duration::from_secs(1))
            .await
            .unwrap();
        // The scripted remote echoes the arguments back as text
        match &result.content[0] {
            crate::protocol::ToolContent::Text { text } => {
                assert!(text.contains("\"a\":2"));
            }
            other => panic!("unexpected content: {:?}", other),
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_by_id() {
        let remote = ScriptedRemote::echoing(vec![tool("echo", "")]);
        let (handle, _events) = spawn_scripted("svc", &remote);
        handle.wait_settled().await;

        let mut joins = Vec::new();
        for i in 0..100 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                let result = handle
                    .call_tool("echo", json!({"seq": i}), Duration::from_secs(5))
                    .await
                    .unwrap();
                match &result.content[0] {
                    crate::protocol::ToolContent::Text { text } => {
                        assert!(text.contains(&format!("\"seq\":{}", i)));
                    }
                    other => panic!("unexpected content: {:?}", other),
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_rejection_leads_to_failed() {
        let remote = ScriptedRemote::rejecting_initialize();
        let (handle, _events) = spawn_scripted("bad", &remote);

        assert_eq!(handle.wait_settled().await, ServiceState::Failed);
        assert!(handle.last_error().unwrap().contains("initialize"));

        // Calls against a failed service resolve immediately
        let err = handle
            .call_tool("x", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServiceNotReady { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_reconnects() {
        let remote = ScriptedRemote::echoing(vec![tool("slow", "")]);
        let (handle, _events) = spawn_scripted("flaky", &remote);
        handle.wait_settled().await;

        // Ask the scripted remote to drop the connection mid-call
        let err = handle
            .call_tool("slow", json!({"__disconnect": true}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ChannelClosed { .. }));

        // The task reconnects on its own and becomes Ready again
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if handle.state() == ServiceState::Ready {
                break;
            }
            assert!(Instant::now() < deadline, "service never recovered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_list_changed_triggers_refetch() {
        let remote = ScriptedRemote::echoing(vec![tool("one", "")]);
        let (handle, mut events) = spawn_scripted("svc", &remote);
        handle.wait_settled().await;

        // Swap the advertised catalog, then announce the change
        remote.set_tools(vec![tool("one", ""), tool("two", "")]);
        remote.notify_tools_changed();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if handle.tools().len() == 2 {
                break;
            }
            assert!(Instant::now() < deadline, "catalog never refreshed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // A ToolsChanged event was emitted for the new catalog
        let mut saw_two = false;
        while let Ok(event) = events.try_recv() {
            if let ServiceEvent::ToolsChanged { tools, .. } = event {
                saw_two |= tools.len() == 2;
            }
        }
        assert!(saw_two);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_call_deadline_returns_timeout() {
        let remote = ScriptedRemote::echoing(vec![tool("hang", "")]);
        let (handle, _events) = spawn_scripted("svc", &remote);
        handle.wait_settled().await;

        let started = Instant::now();
        let err = handle
            .call_tool("hang", json!({"__hang": true}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_into_failed() {
        let remote = ScriptedRemote::refusing();
        let (handle, _events) = spawn_scripted("down", &remote);
        assert_eq!(handle.wait_settled().await, ServiceState::Failed);
    }
}
