//! One upstream WebSocket session: outbound connect with backoff, a
//! JSON-RPC server loop over the socket, per-request dispatch into the
//! service manager.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use conflux_hub::{ServiceManager, ToolFilter};
use conflux_mcp::protocol::{
    methods, negotiate_protocol_version, InitializeParams, JsonRpcError, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ToolsCallParams,
};
use conflux_mcp::BackoffPolicy;

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Connection lifecycle of one endpoint session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndpointState::Disconnected => "disconnected",
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::Reconnecting => "reconnecting",
            EndpointState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-session tuning shared by every endpoint of one manager
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Reconnect curve; unbounded attempts unless configured otherwise
    pub backoff: BackoffPolicy,

    /// WS-level ping cadence
    pub heartbeat_interval: Duration,

    /// Unanswered-ping budget before the connection is declared dead
    pub heartbeat_timeout: Duration,

    /// Deadline applied to each `tools/call` dispatched into the hub
    pub call_deadline: Duration,

    /// Notifications buffered across disconnects; overflow drops the oldest
    pub notification_backlog: usize,

    /// Grace window for draining in-flight responses on close
    pub drain_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::unbounded(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            call_deadline: Duration::from_secs(30),
            notification_backlog: 64,
            drain_grace: Duration::from_secs(2),
        }
    }
}

enum SessionCommand {
    Close { reply: oneshot::Sender<()> },
}

/// Bounded queue of notification frames shared between the handle and the
/// session task. Overflow drops the oldest entry, whether the session is
/// connected or sitting out a reconnect gap.
#[derive(Clone)]
struct NotificationQueue {
    url: String,
    inner: Arc<std::sync::Mutex<VecDeque<String>>>,
    capacity: usize,
    wake: Arc<tokio::sync::Notify>,
}

impl NotificationQueue {
    fn new(url: String, capacity: usize) -> Self {
        Self {
            url,
            inner: Arc::new(std::sync::Mutex::new(VecDeque::new())),
            capacity,
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Push a frame, dropping the oldest one first when at capacity
    fn push(&self, frame: String) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                tracing::warn!(url = %self.url, "notification backlog full, dropping oldest");
            }
            queue.push_back(frame);
        }
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<String> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Resolves once a push has happened since the last wait
    async fn wakeup(&self) {
        self.wake.notified().await
    }
}

/// Owner-side handle to a running session task
#[derive(Clone)]
pub struct EndpointHandle {
    url: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    notifications: NotificationQueue,
    state_rx: watch::Receiver<EndpointState>,
}

impl EndpointHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> EndpointState {
        *self.state_rx.borrow()
    }

    /// Queue a `notifications/tools/list_changed` toward the agent.
    /// Non-blocking: a slow session never stalls the broadcast, it just
    /// ages out its own oldest queued notification.
    pub fn notify_tools_changed(&self) {
        self.notifications.push(tools_changed_frame());
    }

    /// Close the socket with a normal-closure status and stop the task
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Spawns session tasks
pub struct EndpointSession;

impl EndpointSession {
    pub fn spawn(
        url: String,
        settings: SessionSettings,
        hub: Arc<ServiceManager>,
    ) -> EndpointHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(EndpointState::Disconnected);
        let notifications = NotificationQueue::new(url.clone(), settings.notification_backlog);

        let handle = EndpointHandle {
            url: url.clone(),
            cmd_tx,
            notifications: notifications.clone(),
            state_rx,
        };

        let task = SessionTask {
            url,
            settings,
            hub,
            cmd_rx,
            state_tx,
            initialized: false,
            notifications,
        };
        tokio::spawn(task.run());

        handle
    }
}

enum ConnEnd {
    /// Explicit close; do not reconnect
    Closed,
    /// Transport drop; reconnect per backoff
    Dropped(String),
}

struct SessionTask {
    url: String,
    settings: SessionSettings,
    hub: Arc<ServiceManager>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<EndpointState>,
    initialized: bool,
    notifications: NotificationQueue,
}

impl SessionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(if attempt == 0 {
                EndpointState::Connecting
            } else {
                EndpointState::Reconnecting
            });

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::info!(url = %self.url, "endpoint connected");
                    attempt = 0;
                    self.initialized = false;
                    self.set_state(EndpointState::Connected);

                    match self.serve(ws).await {
                        ConnEnd::Closed => {
                            self.set_state(EndpointState::Disconnected);
                            return;
                        }
                        ConnEnd::Dropped(reason) => {
                            tracing::warn!(url = %self.url, reason = %reason, "endpoint connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "endpoint connect failed");
                }
            }

            attempt += 1;
            if self.settings.backoff.is_exhausted(attempt) {
                tracing::error!(url = %self.url, attempts = attempt, "endpoint permanently failed");
                self.set_state(EndpointState::Failed);
                self.park().await;
                return;
            }

            let delay = self.settings.backoff.delay_for(attempt);
            if self.backoff_wait(delay).await {
                self.set_state(EndpointState::Disconnected);
                return;
            }
        }
    }

    fn set_state(&self, state: EndpointState) {
        self.state_tx.send_replace(state);
    }

    async fn serve(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> ConnEnd {
        let (mut sink, mut stream) = ws.split();

        // Notifications buffered across the gap go out first
        while let Some(frame) = self.notifications.pop() {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                return ConnEnd::Dropped(e.to_string());
            }
        }

        // All responses funnel through one writer so frames never interleave
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let mut inflight: JoinSet<()> = JoinSet::new();

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();
        let mut pong_deadline: Option<Instant> = None;

        enum Step {
            In(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
            Out(Option<String>),
            Cmd(Option<SessionCommand>),
            Notify,
            Heartbeat,
            PongTimeout,
        }

        loop {
            let step = tokio::select! {
                message = stream.next() => Step::In(message),
                frame = out_rx.recv() => Step::Out(frame),
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                _ = self.notifications.wakeup() => Step::Notify,
                _ = heartbeat.tick() => Step::Heartbeat,
                _ = sleep_until_opt(pong_deadline), if pong_deadline.is_some() => Step::PongTimeout,
            };

            match step {
                Step::In(None) => {
                    inflight.abort_all();
                    return ConnEnd::Dropped("socket closed".to_string());
                }
                Step::In(Some(Err(e))) => {
                    inflight.abort_all();
                    return ConnEnd::Dropped(e.to_string());
                }
                Step::In(Some(Ok(Message::Text(text)))) => {
                    self.dispatch(&text, &out_tx, &mut inflight);
                }
                Step::In(Some(Ok(Message::Ping(payload)))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        inflight.abort_all();
                        return ConnEnd::Dropped("pong write failed".to_string());
                    }
                }
                Step::In(Some(Ok(Message::Pong(_)))) => {
                    pong_deadline = None;
                }
                Step::In(Some(Ok(Message::Close(_)))) => {
                    inflight.abort_all();
                    return ConnEnd::Dropped("remote closed".to_string());
                }
                Step::In(Some(Ok(_))) => {} // binary frames are not part of the dialect

                Step::Out(Some(frame)) => {
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        inflight.abort_all();
                        return ConnEnd::Dropped(e.to_string());
                    }
                }
                Step::Out(None) => unreachable!("session holds a sender"),

                Step::Notify => {
                    // Pushes racing this drain leave a wake permit behind
                    while let Some(frame) = self.notifications.pop() {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            inflight.abort_all();
                            return ConnEnd::Dropped(e.to_string());
                        }
                    }
                }
                Step::Cmd(Some(SessionCommand::Close { reply })) => {
                    let end = self
                        .graceful_close(&mut sink, &mut out_rx, &mut inflight)
                        .await;
                    self.set_state(EndpointState::Disconnected);
                    let _ = reply.send(());
                    return end;
                }
                Step::Cmd(None) => {
                    // Every handle dropped: same graceful path
                    return self
                        .graceful_close(&mut sink, &mut out_rx, &mut inflight)
                        .await;
                }

                Step::Heartbeat => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        inflight.abort_all();
                        return ConnEnd::Dropped("ping write failed".to_string());
                    }
                    pong_deadline = Some(Instant::now() + self.settings.heartbeat_timeout);
                }
                Step::PongTimeout => {
                    inflight.abort_all();
                    return ConnEnd::Dropped("heartbeat timed out".to_string());
                }
            }
        }
    }

    /// Parse one inbound frame and dispatch it. Responses are pushed into
    /// the writer queue; slow tool calls run on their own tasks.
    fn dispatch(&mut self, text: &str, out_tx: &mpsc::Sender<String>, inflight: &mut JoinSet<()>) {
        let message = match JsonRpcMessage::from_frame(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "malformed frame from agent");
                push_response(
                    out_tx,
                    JsonRpcResponse::error(
                        JsonRpcError::new(-32700, "Parse error", None),
                        None,
                    ),
                );
                return;
            }
        };

        let request = match message {
            JsonRpcMessage::Request(request) => request,
            JsonRpcMessage::Response(_) => {
                tracing::debug!(url = %self.url, "unexpected response frame from agent");
                return;
            }
        };

        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => {
                let peer_version = request
                    .params
                    .as_ref()
                    .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok())
                    .map(|p| p.protocol_version)
                    .unwrap_or_default();
                let result = json!({
                    "protocolVersion": negotiate_protocol_version(&peer_version),
                    "capabilities": ServerCapabilities::aggregating(),
                    "serverInfo": {
                        "name": "conflux",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                });
                push_response(out_tx, JsonRpcResponse::success(result, id));
            }
            methods::INITIALIZED => {
                self.initialized = true;
                tracing::debug!(url = %self.url, "agent completed handshake");
            }
            methods::PING => {
                if id.is_some() {
                    push_response(out_tx, JsonRpcResponse::success(json!({}), id));
                }
            }
            methods::TOOLS_LIST => {
                if !self.initialized {
                    tracing::debug!(url = %self.url, "tools/list before initialized notification");
                }
                let hub = self.hub.clone();
                let out_tx = out_tx.clone();
                inflight.spawn(async move {
                    let tools: Vec<Value> = hub
                        .list_tools(ToolFilter::Enabled)
                        .await
                        .into_iter()
                        .map(|t| {
                            json!({
                                "name": t.name,
                                "description": t.description,
                                "inputSchema": t.input_schema,
                            })
                        })
                        .collect();
                    push_response(
                        &out_tx,
                        JsonRpcResponse::success(json!({ "tools": tools }), id),
                    );
                });
            }
            methods::TOOLS_CALL => {
                let params = request
                    .params
                    .clone()
                    .map(serde_json::from_value::<ToolsCallParams>)
                    .transpose();
                let params = match params {
                    Ok(Some(params)) => params,
                    _ => {
                        push_response(
                            out_tx,
                            JsonRpcResponse::error(
                                JsonRpcError::invalid_params("tools/call needs {name, arguments}"),
                                id,
                            ),
                        );
                        return;
                    }
                };

                let hub = self.hub.clone();
                let out_tx = out_tx.clone();
                let deadline = self.settings.call_deadline;
                inflight.spawn(async move {
                    let args = params.arguments.unwrap_or_else(|| json!({}));
                    let response = match hub.call_tool(&params.name, args, deadline).await {
                        Ok(result) => JsonRpcResponse::success(
                            serde_json::to_value(result).unwrap_or(Value::Null),
                            id,
                        ),
                        Err(e) => {
                            JsonRpcResponse::error(JsonRpcError::from_mcp_error(&e), id)
                        }
                    };
                    push_response(&out_tx, response);
                });
            }
            other if request.is_notification() => {
                tracing::debug!(url = %self.url, method = %other, "ignoring notification");
            }
            other => {
                push_response(
                    out_tx,
                    JsonRpcResponse::error(JsonRpcError::method_not_found(other), id),
                );
            }
        }
    }

    /// Sleep out a backoff delay while answering commands. Notifications
    /// pushed during the gap accumulate in the shared queue and are
    /// drained on the next connection. Returns true when close was
    /// requested.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return true,
                    Some(SessionCommand::Close { reply }) => {
                        self.set_state(EndpointState::Disconnected);
                        let _ = reply.send(());
                        return true;
                    }
                },
            }
        }
    }

    /// Terminal `Failed` parking: keep answering commands until closed
    async fn park(&mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                SessionCommand::Close { reply } => {
                    self.set_state(EndpointState::Disconnected);
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }
}

impl SessionTask {
    /// Drain in-flight responses up to the grace window, then close the
    /// socket with a normal-closure status.
    async fn graceful_close(
        &mut self,
        sink: &mut WsSink,
        out_rx: &mut mpsc::Receiver<String>,
        inflight: &mut JoinSet<()>,
    ) -> ConnEnd {
        let deadline = Instant::now() + self.settings.drain_grace;

        while !inflight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(url = %self.url, "drain grace elapsed, aborting in-flight calls");
                inflight.abort_all();
                break;
            }
            match tokio::time::timeout(remaining, inflight.join_next()).await {
                Ok(Some(_)) => {
                    while let Ok(frame) = out_rx.try_recv() {
                        let _ = sink.send(Message::Text(frame)).await;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(url = %self.url, "drain grace elapsed, aborting in-flight calls");
                    inflight.abort_all();
                    break;
                }
            }
        }

        while let Ok(frame) = out_rx.try_recv() {
            let _ = sink.send(Message::Text(frame)).await;
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;

        ConnEnd::Closed
    }
}

fn tools_changed_frame() -> String {
    JsonRpcMessage::from(JsonRpcRequest::notification(
        methods::TOOLS_LIST_CHANGED,
        None,
    ))
    .to_frame()
    .expect("notification serializes")
}

fn push_response(out_tx: &mpsc::Sender<String>, response: JsonRpcResponse) {
    match JsonRpcMessage::from(response).to_frame() {
        Ok(frame) => {
            if out_tx.try_send(frame).is_err() {
                tracing::warn!("response queue full, dropping frame");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize response"),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
