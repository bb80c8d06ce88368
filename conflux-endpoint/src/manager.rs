//! Endpoint manager: the session set keyed by URL, plus hub-event fan-out.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use conflux_hub::{HubEvent, ServiceManager};

use crate::session::{EndpointHandle, EndpointSession, EndpointState, SessionSettings};

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub state: EndpointState,
}

/// Owns every upstream session. Hub events are forwarded to each session
/// through its own bounded queue, so one slow or dead session never holds
/// up the others.
pub struct EndpointManager {
    hub: Arc<ServiceManager>,
    settings: SessionSettings,
    sessions: RwLock<HashMap<String, EndpointHandle>>,
}

impl EndpointManager {
    pub fn new(hub: Arc<ServiceManager>, settings: SessionSettings) -> Arc<Self> {
        let manager = Arc::new(Self {
            hub: hub.clone(),
            settings,
            sessions: RwLock::new(HashMap::new()),
        });

        tokio::spawn(Self::forward_events(
            Arc::downgrade(&manager),
            hub.events().subscribe(),
        ));

        manager
    }

    /// Open a session toward a new agent URL. Returns false when one
    /// already exists for it.
    pub async fn add_endpoint(&self, url: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(url) {
            return false;
        }
        tracing::info!(url = %url, "adding endpoint");
        let handle =
            EndpointSession::spawn(url.to_string(), self.settings.clone(), self.hub.clone());
        sessions.insert(url.to_string(), handle);
        true
    }

    /// Close and forget one session. Returns false when the URL is unknown.
    pub async fn remove_endpoint(&self, url: &str) -> bool {
        let handle = self.sessions.write().await.remove(url);
        match handle {
            Some(handle) => {
                tracing::info!(url = %url, "removing endpoint");
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Open sessions for every configured URL
    pub async fn connect_all(&self, urls: &[String]) {
        for url in urls {
            self.add_endpoint(url).await;
        }
    }

    /// Close every session, leaving the set empty
    pub async fn disconnect_all(&self) {
        let handles: Vec<EndpointHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    pub async fn status(&self) -> Vec<EndpointStatus> {
        let sessions = self.sessions.read().await;
        let mut statuses: Vec<EndpointStatus> = sessions
            .values()
            .map(|handle| EndpointStatus {
                url: handle.url().to_string(),
                state: handle.state(),
            })
            .collect();
        statuses.sort_by(|a, b| a.url.cmp(&b.url));
        statuses
    }

    async fn forward_events(
        manager: Weak<Self>,
        mut events: tokio::sync::broadcast::Receiver<HubEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed = missed, "event forwarder lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            let Some(manager) = manager.upgrade() else {
                return;
            };

            if let HubEvent::ToolsListChanged = event {
                let sessions = manager.sessions.read().await;
                for handle in sessions.values() {
                    handle.notify_tools_changed();
                }
            }
        }
    }
}
