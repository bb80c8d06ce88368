//! Scripted in-memory transports for exercising the service layer without
//! real processes or sockets. Available to downstream crates through the
//! `test-util` feature.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{McpError, McpResult};
use crate::protocol::{
    methods, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallResult,
    ToolsListResult, MCP_PROTOCOL_VERSION,
};
use crate::transport::{Transport, TransportFactory, TransportState};

/// Convenience tool constructor
pub fn tool(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({ "type": "object" }),
    }
}

#[derive(Default)]
struct RemoteInner {
    tools: Mutex<Vec<Tool>>,
    /// Inbound sender of the transport currently connected, for pushing
    /// server-initiated notifications
    live: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    calls: std::sync::atomic::AtomicUsize,
    reject_initialize: bool,
    refuse_connect: bool,
}

/// A fake downstream MCP remote.
///
/// Cloning shares the remote, so a test can reconfigure the advertised
/// catalog or push notifications while a service task is connected. Each
/// `connect()` on a produced transport represents a fresh connection to
/// the same remote, which is exactly how reconnecting services see the
/// world.
///
/// The scripted `tools/call` understands two magic argument keys:
/// `__disconnect` drops the connection instead of answering, `__hang`
/// swallows the request so deadline handling can be observed.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    inner: Arc<RemoteInner>,
}

impl ScriptedRemote {
    /// Remote that completes the handshake and echoes call arguments back
    pub fn echoing(tools: Vec<Tool>) -> Self {
        let remote = Self::default();
        *remote.inner.tools.lock().unwrap() = tools;
        remote
    }

    /// Remote that answers `initialize` with a JSON-RPC error
    pub fn rejecting_initialize() -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                reject_initialize: true,
                ..Default::default()
            }),
        }
    }

    /// Remote whose connections are refused outright
    pub fn refusing() -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                refuse_connect: true,
                ..Default::default()
            }),
        }
    }

    /// Replace the advertised catalog
    pub fn set_tools(&self, tools: Vec<Tool>) {
        *self.inner.tools.lock().unwrap() = tools;
    }

    /// How many `tools/call` requests this remote has served
    pub fn call_count(&self) -> usize {
        self.inner.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Push a `notifications/tools/list_changed` to the connected client
    pub fn notify_tools_changed(&self) {
        if let Some(live) = self.inner.live.lock().unwrap().as_ref() {
            let _ = live.try_send(
                JsonRpcRequest::notification(methods::TOOLS_LIST_CHANGED, None).into(),
            );
        }
    }

    /// Transport factory handing out connections to this remote
    pub fn factory(&self) -> TransportFactory {
        let remote = self.clone();
        Arc::new(move |_| {
            Ok(Box::new(ScriptedChannel::new(remote.clone())) as Box<dyn Transport>)
        })
    }
}

/// One scripted connection to a [`ScriptedRemote`]
pub struct ScriptedChannel {
    remote: ScriptedRemote,
    inbound_tx: Option<mpsc::Sender<JsonRpcMessage>>,
    inbound_rx: Option<mpsc::Receiver<JsonRpcMessage>>,
    state: TransportState,
}

impl ScriptedChannel {
    fn new(remote: ScriptedRemote) -> Self {
        Self {
            remote,
            inbound_tx: None,
            inbound_rx: None,
            state: TransportState::Disconnected,
        }
    }

    fn respond(&self, response: JsonRpcResponse) {
        if let Some(tx) = &self.inbound_tx {
            let _ = tx.try_send(response.into());
        }
    }

    fn drop_connection(&mut self) {
        self.inbound_tx = None;
        *self.remote.inner.live.lock().unwrap() = None;
    }

    fn handle_request(&mut self, request: JsonRpcRequest) {
        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => {
                if self.remote.inner.reject_initialize {
                    self.respond(JsonRpcResponse::error(
                        JsonRpcError::invalid_request("initialize rejected by remote"),
                        id,
                    ));
                    return;
                }
                self.respond(JsonRpcResponse::success(
                    json!({
                        "protocolVersion": MCP_PROTOCOL_VERSION,
                        "capabilities": { "tools": { "listChanged": true } },
                        "serverInfo": { "name": "scripted", "version": "0.0.0" }
                    }),
                    id,
                ));
            }
            methods::TOOLS_LIST => {
                let listing = ToolsListResult {
                    tools: self.remote.inner.tools.lock().unwrap().clone(),
                    next_cursor: None,
                };
                self.respond(JsonRpcResponse::success(
                    serde_json::to_value(&listing).unwrap(),
                    id,
                ));
            }
            methods::TOOLS_CALL => {
                self.remote
                    .inner
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let args = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);

                if args.get("__disconnect").and_then(Value::as_bool) == Some(true) {
                    self.drop_connection();
                    return;
                }
                if args.get("__hang").and_then(Value::as_bool) == Some(true) {
                    return;
                }

                let echo = serde_json::to_string(&args).unwrap();
                self.respond(JsonRpcResponse::success(
                    serde_json::to_value(ToolsCallResult::text(echo)).unwrap(),
                    id,
                ));
            }
            methods::PING if id.is_some() => {
                self.respond(JsonRpcResponse::success(json!({}), id));
            }
            _ => {} // notifications and unknown methods are swallowed
        }
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedChannel {
    async fn connect(&mut self) -> McpResult<()> {
        if self.remote.inner.refuse_connect {
            self.state = TransportState::Error;
            return Err(McpError::connection_failed("scripted remote refused"));
        }
        let (tx, rx) = mpsc::channel(100);
        *self.remote.inner.live.lock().unwrap() = Some(tx.clone());
        self.inbound_tx = Some(tx);
        self.inbound_rx = Some(rx);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        if self.inbound_tx.is_none() {
            return Err(McpError::channel_closed("scripted connection dropped"));
        }
        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request),
            JsonRpcMessage::Response(_) => {} // client answers to server pings
        }
        Ok(())
    }

    async fn receive(&mut self) -> McpResult<JsonRpcMessage> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        let rx = self
            .inbound_rx
            .as_mut()
            .ok_or_else(|| McpError::channel_closed("transport not connected"))?;
        match rx.recv().await {
            Some(message) => Ok(message),
            None => {
                self.state = TransportState::Error;
                Err(McpError::channel_closed("scripted connection dropped"))
            }
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn close(&mut self) -> McpResult<()> {
        self.state = TransportState::Disconnected;
        self.drop_connection();
        self.inbound_rx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_handshake() {
        let remote = ScriptedRemote::echoing(vec![tool("add", "adds")]);
        let mut transport = (remote.factory())(&conflux_config::TransportKind::Stdio {
            command: "unused".to_string(),
            args: vec![],
            env: Default::default(),
        })
        .unwrap();

        transport.connect().await.unwrap();
        transport
            .send(JsonRpcRequest::with_id(methods::INITIALIZE, None, 1).into())
            .await
            .unwrap();
        let reply = transport.receive().await.unwrap();
        match reply {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.result.unwrap()["serverInfo"]["name"], "scripted")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_disconnect_key() {
        let remote = ScriptedRemote::echoing(vec![]);
        let mut transport = (remote.factory())(&conflux_config::TransportKind::Stdio {
            command: "unused".to_string(),
            args: vec![],
            env: Default::default(),
        })
        .unwrap();
        transport.connect().await.unwrap();

        transport
            .send(
                JsonRpcRequest::with_id(
                    methods::TOOLS_CALL,
                    Some(json!({"name": "x", "arguments": {"__disconnect": true}})),
                    1,
                )
                .into(),
            )
            .await
            .unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, McpError::ChannelClosed { .. }));
    }
}
