//! Transport adapters for downstream MCP services.
//!
//! One [`Transport`] trait fronts the three wire flavors: stdio child
//! processes, streamable HTTP endpoints and SSE streams (plus the
//! credentialed ModelScope flavor of SSE). Adapters move complete JSON-RPC
//! frames only; id correlation and the MCP handshake live in the service
//! wrapper, not here.

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::StreamableHttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conflux_config::TransportKind;

use crate::error::McpResult;
use crate::protocol::JsonRpcMessage;

/// Connection state of a transport adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// One bidirectional JSON-RPC channel to a downstream service.
///
/// `receive` yields complete frames until the channel ends; after
/// `close()` or a remote disconnect it fails with `ChannelClosed`.
/// Adapters never restart themselves after a hard disconnect; that is
/// the owning service's reconnection concern.
#[async_trait]
pub trait Transport: Send {
    /// Establish the underlying channel; returns once frames can flow
    async fn connect(&mut self) -> McpResult<()>;

    /// Enqueue one message toward the remote
    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()>;

    /// Next message from the remote
    async fn receive(&mut self) -> McpResult<JsonRpcMessage>;

    fn state(&self) -> TransportState;

    /// Release the channel; idempotent
    async fn close(&mut self) -> McpResult<()>;
}

/// Creates transports from configuration. Injectable so tests can swap in
/// scripted in-memory transports.
pub type TransportFactory = Arc<dyn Fn(&TransportKind) -> McpResult<Box<dyn Transport>> + Send + Sync>;

/// Factory backed by the real adapters
pub fn default_factory() -> TransportFactory {
    Arc::new(|kind| create_transport(kind))
}

/// Build the adapter for a resolved transport configuration
pub fn create_transport(kind: &TransportKind) -> McpResult<Box<dyn Transport>> {
    match kind {
        TransportKind::Stdio { command, args, env } => Ok(Box::new(StdioTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
        )?)),
        TransportKind::StreamableHttp {
            url,
            headers,
            api_key,
        } => Ok(Box::new(StreamableHttpTransport::new(
            url.clone(),
            headers.clone(),
            api_key.clone(),
        )?)),
        TransportKind::Sse {
            url,
            headers,
            api_key,
        } => Ok(Box::new(SseTransport::new(
            url.clone(),
            headers.clone(),
            api_key.clone(),
            false,
        )?)),
        TransportKind::ModelScopeSse {
            url,
            headers,
            api_key,
        } => Ok(Box::new(SseTransport::new(
            url.clone(),
            headers.clone(),
            api_key.clone(),
            true,
        )?)),
    }
}

/// Tracks malformed frames from one remote. A single bad frame is logged
/// and discarded; two inside the window tear the connection down.
#[derive(Debug)]
pub struct ProtocolErrorWindow {
    window: Duration,
    last: Option<Instant>,
}

impl ProtocolErrorWindow {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record one malformed frame; returns true when the connection should
    /// be torn down.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        let tear_down = matches!(self.last, Some(prev) if now.duration_since(prev) <= self.window);
        self.last = Some(now);
        tear_down
    }
}

impl Default for ProtocolErrorWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_window() {
        let mut w = ProtocolErrorWindow::new(Duration::from_secs(10));
        assert!(!w.record());
        assert!(w.record());
    }

    #[test]
    fn test_factory_rejects_empty_command() {
        let kind = TransportKind::Stdio {
            command: "".to_string(),
            args: vec![],
            env: Default::default(),
        };
        assert!(create_transport(&kind).is_err());
    }

    #[test]
    fn test_factory_builds_all_variants() {
        let stdio = TransportKind::Stdio {
            command: "cat".to_string(),
            args: vec![],
            env: Default::default(),
        };
        assert!(create_transport(&stdio).is_ok());

        let http = TransportKind::StreamableHttp {
            url: "https://example.com/mcp".to_string(),
            headers: Default::default(),
            api_key: None,
        };
        assert!(create_transport(&http).is_ok());

        let sse = TransportKind::Sse {
            url: "https://example.com/sse".to_string(),
            headers: Default::default(),
            api_key: None,
        };
        assert!(create_transport(&sse).is_ok());
    }
}
