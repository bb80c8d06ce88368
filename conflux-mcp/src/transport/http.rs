//! Streamable HTTP transport: one endpoint, requests POSTed as JSON,
//! responses either a single JSON body or a chunked event stream that is
//! demultiplexed into the ordinary receive sequence.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::sse::SseFrameBuffer;
use super::{ProtocolErrorWindow, Transport, TransportState};
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct StreamableHttpTransport {
    url: String,
    headers: HashMap<String, String>,
    bearer: Option<String>,

    client: reqwest::Client,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: mpsc::Receiver<JsonRpcMessage>,

    /// Session id issued by the remote on initialize, echoed on every
    /// subsequent request. Shared with stream-draining tasks.
    session_id: Arc<Mutex<Option<String>>>,

    state: TransportState,
}

impl StreamableHttpTransport {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        bearer: Option<String>,
    ) -> McpResult<Self> {
        let parsed = url::Url::parse(&url)
            .map_err(|e| McpError::configuration(format!("invalid URL '{}': {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(McpError::configuration(format!(
                    "unsupported URL scheme '{}'",
                    scheme
                )))
            }
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::internal(format!("failed to build HTTP client: {}", e)))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(100);

        Ok(Self {
            url,
            headers,
            bearer,
            client,
            inbound_tx,
            inbound_rx,
            session_id: Arc::new(Mutex::new(None)),
            state: TransportState::Disconnected,
        })
    }

    fn build_post(&self, message: &JsonRpcMessage) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");

        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(session) = self.session_id.lock().unwrap().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.json(message)
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(SESSION_HEADER) {
            if let Ok(session) = value.to_str() {
                *self.session_id.lock().unwrap() = Some(session.to_string());
            }
        }
    }

    /// Drain a streamed response body into the inbound queue from its own
    /// task so `send` returns as soon as the request is accepted.
    fn spawn_stream_drain(&self, response: reqwest::Response) {
        let inbound = self.inbound_tx.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut frames = SseFrameBuffer::new();
            let mut parse_errors = ProtocolErrorWindow::default();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::debug!(url = %url, "response stream ended: {}", e);
                        return;
                    }
                };
                let Ok(text) = std::str::from_utf8(&chunk) else {
                    tracing::warn!(url = %url, "dropping non-UTF-8 chunk");
                    continue;
                };
                for event in frames.push(text) {
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    match JsonRpcMessage::from_frame(&event.data) {
                        Ok(message) => {
                            if inbound.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(url = %url, error = %e, "discarding malformed stream frame");
                            if parse_errors.record() {
                                tracing::error!(url = %url, "repeated malformed frames, abandoning stream");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&mut self) -> McpResult<()> {
        // The endpoint is request/response: there is nothing to establish
        // ahead of the first POST, so connect only validates local state.
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }

        let response = self.build_post(&message).send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection_failed(format!("connect to {} failed: {}", self.url, e))
            } else {
                McpError::connection_failed(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(McpError::auth_required(format!(
                "endpoint rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "endpoint returned {}",
                status
            )));
        }

        self.capture_session(&response);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.spawn_stream_drain(response);
        } else {
            // Notifications are commonly answered 202 with an empty body
            let body = response
                .text()
                .await
                .map_err(|e| McpError::connection_failed(e.to_string()))?;
            if !body.trim().is_empty() {
                let message = JsonRpcMessage::from_frame(&body)?;
                self.inbound_tx
                    .send(message)
                    .await
                    .map_err(|_| McpError::channel_closed("inbound queue closed"))?;
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> McpResult<JsonRpcMessage> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        match self.inbound_rx.recv().await {
            Some(message) => Ok(message),
            None => {
                self.state = TransportState::Error;
                Err(McpError::channel_closed("inbound queue closed"))
            }
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn close(&mut self) -> McpResult<()> {
        self.state = TransportState::Disconnected;
        *self.session_id.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;

    #[test]
    fn test_url_validation() {
        assert!(StreamableHttpTransport::new(
            "https://example.com/mcp".to_string(),
            HashMap::new(),
            None
        )
        .is_ok());
        assert!(
            StreamableHttpTransport::new("not a url".to_string(), HashMap::new(), None).is_err()
        );
        assert!(StreamableHttpTransport::new(
            "file:///etc/passwd".to_string(),
            HashMap::new(),
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let mut transport = StreamableHttpTransport::new(
            "https://example.com/mcp".to_string(),
            HashMap::new(),
            None,
        )
        .unwrap();
        let request = JsonRpcRequest::with_id("ping", None, 1);
        let err = transport.send(request.into()).await.unwrap_err();
        assert!(matches!(err, McpError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_close_then_receive_fails() {
        let mut transport = StreamableHttpTransport::new(
            "https://example.com/mcp".to_string(),
            HashMap::new(),
            None,
        )
        .unwrap();
        transport.connect().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, McpError::ChannelClosed { .. }));
    }
}
