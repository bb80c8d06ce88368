//! SSE transport: a `text/event-stream` GET for server→client frames and a
//! POST endpoint, discovered from the initial `endpoint` event, for
//! client→server frames.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{ProtocolErrorWindow, Transport, TransportState};
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;

/// Consecutive failed resubscribe attempts before the adapter gives up and
/// closes the inbound channel (the owning service reconnects from scratch).
const RESUBSCRIBE_ATTEMPTS: u32 = 5;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// How long connect() waits for the remote's `endpoint` event
const ENDPOINT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One parsed SSE event
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental parser over `text/event-stream` bytes. Events are
/// blank-line separated; multiple `data:` lines join with newlines.
#[derive(Debug, Default)]
pub(crate) struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(boundary) = self.find_boundary() {
            let (raw, rest_start) = boundary;
            let raw_event = self.buffer[..raw].to_string();
            self.buffer.drain(..rest_start);

            if let Some(event) = Self::parse_event(&raw_event) {
                events.push(event);
            }
        }

        events
    }

    fn find_boundary(&self) -> Option<(usize, usize)> {
        // Accept both \n\n and \r\n\r\n separators
        let lf = self.buffer.find("\n\n").map(|i| (i, i + 2));
        let crlf = self.buffer.find("\r\n\r\n").map(|i| (i, i + 4));
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn parse_event(raw: &str) -> Option<SseEvent> {
        let mut event = SseEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();

        for line in raw.lines() {
            if line.starts_with(':') {
                continue; // comment / keep-alive
            }
            if let Some(value) = line.strip_prefix("event:") {
                event.event = value.trim_start().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            } else if let Some(value) = line.strip_prefix("id:") {
                event.id = Some(value.trim_start().to_string());
            }
            // retry: and unknown fields are ignored
        }

        if data_lines.is_empty() && event.event.is_empty() && event.id.is_none() {
            return None;
        }
        event.data = data_lines.join("\n");
        Some(event)
    }
}

/// SSE transport. With `require_auth` set (the ModelScope flavor) a
/// missing bearer token fails `connect()` outright.
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    bearer: Option<String>,
    require_auth: bool,

    client: reqwest::Client,
    inbound_rx: Option<mpsc::Receiver<JsonRpcMessage>>,
    /// Message endpoint announced by the remote; a resubscribe may move it
    endpoint_rx: Option<watch::Receiver<Option<String>>>,
    closed: Arc<AtomicBool>,
    reader: Option<tokio::task::JoinHandle<()>>,
    state: TransportState,
}

impl SseTransport {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        bearer: Option<String>,
        require_auth: bool,
    ) -> McpResult<Self> {
        let parsed = url::Url::parse(&url)
            .map_err(|e| McpError::configuration(format!("invalid SSE URL '{}': {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(McpError::configuration(format!(
                    "unsupported SSE URL scheme '{}'",
                    scheme
                )))
            }
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url,
            headers,
            bearer,
            require_auth,
            client,
            inbound_rx: None,
            endpoint_rx: None,
            closed: Arc::new(AtomicBool::new(false)),
            reader: None,
            state: TransportState::Disconnected,
        })
    }

    fn stream_request(&self, last_event_id: Option<&str>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");

        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(id) = last_event_id {
            builder = builder.header("Last-Event-ID", id);
        }
        builder
    }

    async fn open_stream(&self, last_event_id: Option<&str>) -> McpResult<reqwest::Response> {
        let response = self
            .stream_request(last_event_id)
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("SSE connect failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(McpError::auth_required(format!(
                "SSE endpoint rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE endpoint returned {}",
                status
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&mut self) -> McpResult<()> {
        if self.state == TransportState::Connected {
            return Ok(());
        }

        if self.require_auth && self.bearer.as_deref().map_or(true, str::is_empty) {
            self.state = TransportState::Error;
            return Err(McpError::auth_required(
                "this endpoint requires a bearer token and none is configured",
            ));
        }

        self.state = TransportState::Connecting;
        self.closed.store(false, Ordering::SeqCst);

        let first = match self.open_stream(None).await {
            Ok(resp) => resp,
            Err(e) => {
                self.state = TransportState::Error;
                return Err(e);
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let (endpoint_tx, mut endpoint_rx) = watch::channel(None::<String>);

        let reader = ReaderTask {
            base_url: self.url.clone(),
            transport: self.stream_task_handle(),
            inbound: inbound_tx,
            endpoint: endpoint_tx,
            closed: self.closed.clone(),
        };
        self.reader = Some(tokio::spawn(reader.run(first)));
        self.inbound_rx = Some(inbound_rx);

        // The remote announces its POST endpoint as the first event.
        let discovered = tokio::time::timeout(ENDPOINT_DISCOVERY_TIMEOUT, async {
            loop {
                if let Some(url) = endpoint_rx.borrow_and_update().clone() {
                    return Some(url);
                }
                if endpoint_rx.changed().await.is_err() {
                    // Reader ended before announcing an endpoint
                    return None;
                }
            }
        })
        .await;

        match discovered {
            Ok(Some(_)) => {
                self.endpoint_rx = Some(endpoint_rx);
                self.state = TransportState::Connected;
                Ok(())
            }
            Ok(None) | Err(_) => {
                self.state = TransportState::Error;
                self.closed.store(true, Ordering::SeqCst);
                if let Some(handle) = self.reader.take() {
                    handle.abort();
                }
                Err(McpError::connection_failed(
                    "remote never announced its message endpoint",
                ))
            }
        }
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        let post_url = self
            .endpoint_rx
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
            .ok_or_else(|| McpError::channel_closed("no message endpoint"))?;

        let mut builder = self
            .client
            .post(&post_url)
            .header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .json(&message)
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("SSE POST failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(McpError::auth_required(format!(
                "message endpoint rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "message endpoint returned {}",
                status
            )));
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
                Err(McpError::channel_closed("SSE stream ended"))
            }
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.state == TransportState::Disconnected {
            return Ok(());
        }
        self.state = TransportState::Disconnected;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        self.inbound_rx = None;
        self.endpoint_rx = None;
        Ok(())
    }
}

impl SseTransport {
    fn stream_task_handle(&self) -> StreamOpener {
        StreamOpener {
            client: self.client.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            bearer: self.bearer.clone(),
        }
    }
}

/// Re-opens the GET stream during resubscribe cycles
struct StreamOpener {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    bearer: Option<String>,
}

impl StreamOpener {
    async fn open(&self, last_event_id: Option<&str>) -> McpResult<reqwest::Response> {
        let mut builder = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(id) = last_event_id {
            builder = builder.header("Last-Event-ID", id);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("SSE resubscribe failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE resubscribe returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

struct ReaderTask {
    base_url: String,
    transport: StreamOpener,
    inbound: mpsc::Sender<JsonRpcMessage>,
    endpoint: watch::Sender<Option<String>>,
    closed: Arc<AtomicBool>,
}

impl ReaderTask {
    async fn run(self, first: reqwest::Response) {
        let mut last_event_id: Option<String> = None;
        let mut parse_errors = ProtocolErrorWindow::default();
        let mut response = Some(first);
        let mut failures: u32 = 0;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let resp = match response.take() {
                Some(r) => r,
                None => match self.transport.open(last_event_id.as_deref()).await {
                    Ok(r) => {
                        failures = 0;
                        r
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= RESUBSCRIBE_ATTEMPTS {
                            tracing::warn!(url = %self.base_url, error = %e, "giving up on SSE resubscribe");
                            return; // dropping inbound ends the channel
                        }
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                },
            };

            if !self
                .consume_stream(resp, &mut last_event_id, &mut parse_errors)
                .await
            {
                return;
            }
            // Stream ended without close(): resubscribe
        }
    }

    /// Returns false when the reader should stop for good
    async fn consume_stream(
        &self,
        response: reqwest::Response,
        last_event_id: &mut Option<String>,
        parse_errors: &mut ProtocolErrorWindow,
    ) -> bool {
        let mut stream = response.bytes_stream();
        let mut frames = SseFrameBuffer::new();

        while let Some(chunk) = stream.next().await {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(url = %self.base_url, "SSE stream error: {}", e);
                    return true; // resubscribe
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                tracing::warn!(url = %self.base_url, "dropping non-UTF-8 SSE chunk");
                continue;
            };

            for event in frames.push(text) {
                if let Some(id) = &event.id {
                    *last_event_id = Some(id.clone());
                }
                if !self.handle_event(event, parse_errors).await {
                    return false;
                }
            }
        }
        true
    }

    async fn handle_event(&self, event: SseEvent, parse_errors: &mut ProtocolErrorWindow) -> bool {
        match event.event.as_str() {
            "endpoint" => {
                match resolve_endpoint(&self.base_url, event.data.trim()) {
                    Ok(url) => {
                        let _ = self.endpoint.send(Some(url));
                    }
                    Err(e) => {
                        tracing::warn!(url = %self.base_url, error = %e, "unusable endpoint event");
                    }
                }
                true
            }
            "" | "message" => {
                if event.data.trim().is_empty() || event.data.trim() == "keep-alive" {
                    return true;
                }
                match JsonRpcMessage::from_frame(&event.data) {
                    Ok(message) => self.inbound.send(message).await.is_ok(),
                    Err(e) => {
                        tracing::warn!(url = %self.base_url, error = %e, "discarding malformed SSE frame");
                        if parse_errors.record() {
                            tracing::error!(url = %self.base_url, "repeated malformed frames, closing stream");
                            return false;
                        }
                        true
                    }
                }
            }
            other => {
                tracing::debug!(url = %self.base_url, event = %other, "ignoring SSE event");
                true
            }
        }
    }
}

/// The `endpoint` event may carry an absolute URL or a path relative to
/// the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> McpResult<String> {
    let base_url = url::Url::parse(base)
        .map_err(|e| McpError::configuration(format!("invalid base URL: {}", e)))?;
    let resolved = base_url
        .join(endpoint)
        .map_err(|e| McpError::protocol(format!("bad endpoint event '{}': {}", endpoint, e)))?;
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_single_event() {
        let mut buf = SseFrameBuffer::new();
        let events = buf.push("event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_frame_buffer_split_across_chunks() {
        let mut buf = SseFrameBuffer::new();
        assert!(buf.push("data: {\"a\"").is_empty());
        assert!(buf.push(":2}").is_empty());
        let events = buf.push("\n\ndata: next\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":2}");
        assert_eq!(events[1].data, "next");
    }

    #[test]
    fn test_frame_buffer_multiline_data_and_id() {
        let mut buf = SseFrameBuffer::new();
        let events = buf.push("id: 7\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_frame_buffer_ignores_comments() {
        let mut buf = SseFrameBuffer::new();
        assert!(buf.push(": keep-alive\n\n").is_empty());
    }

    #[test]
    fn test_frame_buffer_crlf_separators() {
        let mut buf = SseFrameBuffer::new();
        let events = buf.push("data: one\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one");
    }

    #[test]
    fn test_endpoint_event_parse() {
        let mut buf = SseFrameBuffer::new();
        let events = buf.push("event: endpoint\ndata: /message?sessionId=abc\n\n");
        assert_eq!(events[0].event, "endpoint");
        let resolved = resolve_endpoint("https://example.com/sse", &events[0].data).unwrap();
        assert_eq!(resolved, "https://example.com/message?sessionId=abc");
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let resolved =
            resolve_endpoint("https://example.com/sse", "https://other.example.com/msg").unwrap();
        assert_eq!(resolved, "https://other.example.com/msg");
    }

    #[tokio::test]
    async fn test_missing_bearer_fails_fast_when_required() {
        let mut transport = SseTransport::new(
            "https://example.com/sse".to_string(),
            HashMap::new(),
            None,
            true,
        )
        .unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, McpError::AuthRequired { .. }));
        assert_eq!(transport.state(), TransportState::Error);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(SseTransport::new("not-a-url".to_string(), HashMap::new(), None, false).is_err());
        assert!(
            SseTransport::new("ftp://example.com".to_string(), HashMap::new(), None, false)
                .is_err()
        );
    }
}
