use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventBus, SessionEvent};
use crate::storage::{Storage, TabStorage};

/// The single durable-storage key used as the cross-tab signal.
pub const AUTH_EVENT_KEY: &str = "sessionkeeper.auth_event";

/// State-changing action announced to sibling tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossTabMessage {
    Login,
    Logout,
}

impl CrossTabMessage {
    /// Event raised locally in a tab that receives this message.
    pub fn event(self) -> SessionEvent {
        match self {
            Self::Login => SessionEvent::CrossTabLogin,
            Self::Logout => SessionEvent::CrossTabLogout,
        }
    }
}

/// Stored value. `nonce` makes two identical broadcasts distinct writes, since
/// storage only notifies on an actual change.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Signal {
    kind: CrossTabMessage,
    sent_at: i64,
    #[serde(default)]
    nonce: u32,
}

/// One-shot signalling between tabs over the shared durable store.
#[derive(Clone)]
pub struct CrossTabChannel {
    storage: TabStorage,
    clear_delay: Duration,
}

impl CrossTabChannel {
    pub fn new(storage: TabStorage, clear_delay: Duration) -> Self {
        Self { storage, clear_delay }
    }

    /// Write the sentinel for `message`, then remove it after the clear delay.
    pub fn broadcast(&self, message: CrossTabMessage) {
        let signal = Signal {
            kind: message,
            sent_at: Utc::now().timestamp_millis(),
            nonce: rand::random(),
        };
        let value = match serde_json::to_string(&signal) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode cross-tab signal");
                return;
            }
        };
        if let Err(e) = self.storage.set(AUTH_EVENT_KEY, &value) {
            warn!(?message, error = %e, "Failed to broadcast cross-tab signal");
            return;
        }
        debug!(?message, tab = %self.storage.tab_id(), "Broadcast cross-tab signal");

        let storage = self.storage.clone();
        let delay = self.clear_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A newer signal may have replaced ours; leave that one alone.
            match storage.get(AUTH_EVENT_KEY) {
                Ok(Some(current)) if current == value => {
                    if let Err(e) = storage.remove(AUTH_EVENT_KEY) {
                        warn!(error = %e, "Failed to clear cross-tab signal");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to read cross-tab signal"),
            }
        });
    }

    /// Interpret a storage change. Unknown keys, removals and garbage yield `None`.
    pub fn decode(key: &str, new_value: Option<&str>) -> Option<CrossTabMessage> {
        if key != AUTH_EVENT_KEY {
            return None;
        }
        let raw = new_value?;
        match serde_json::from_str::<Signal>(raw) {
            Ok(signal) => Some(signal.kind),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed cross-tab signal");
                None
            }
        }
    }

    /// Relay signals from other tabs onto the local bus until the store closes.
    pub fn listen(&self, bus: Arc<EventBus>) -> JoinHandle<()> {
        let mut events = self.storage.subscribe();
        let tab = self.storage.tab_id();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(message) = Self::decode(&event.key, event.new_value.as_deref()) {
                    info!(tab = %tab, from = %event.origin, ?message, "Received cross-tab signal");
                    bus.emit(message.event());
                }
            }
            debug!(tab = %tab, "Cross-tab listener stopped");
        })
    }
}
