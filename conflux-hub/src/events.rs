//! Process-wide typed event broadcasting.
//!
//! Decouples the service manager from the endpoint layer and from any
//! external observer: publishers never block, lagging subscribers lose the
//! oldest events and are told how many they missed.

use tokio::sync::broadcast;

use conflux_mcp::ServiceState;

/// Events buffered per subscription before the oldest are dropped
const EVENT_BUFFER_SIZE: usize = 256;

/// Everything the aggregation layer announces
#[derive(Debug, Clone)]
pub enum HubEvent {
    ServiceStateChanged {
        name: String,
        old: ServiceState,
        new: ServiceState,
    },

    /// The aggregate tool catalog changed
    ToolsListChanged,

    ToolCalled {
        name: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    },
}

/// Broadcast bus for [`HubEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    pub fn publish(&self, event: HubEvent) {
        match self.tx.send(event) {
            Ok(subscriber_count) => {
                tracing::trace!(subscribers = subscriber_count, "event published");
            }
            Err(_) => {
                tracing::trace!("no subscribers for event");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(HubEvent::ToolsListChanged);
        match rx.recv().await.unwrap() {
            HubEvent::ToolsListChanged => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        for _ in 0..1000 {
            bus.publish(HubEvent::ToolsListChanged);
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_observes_loss() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..EVENT_BUFFER_SIZE + 10 {
            bus.publish(HubEvent::ToolCalled {
                name: format!("t{}", i),
                success: true,
                duration_ms: 1,
                error: None,
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
