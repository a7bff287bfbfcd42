use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Storage, StorageError};

/// Change notifications kept for slow listeners before they start lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Identity of one tab/window sharing the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(u64);

impl TabId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A change made to the shared store by some tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub origin: TabId,
}

/// Durable storage shared by every tab of one origin.
///
/// Writes through any [`TabStorage`] handle are visible to all handles, and
/// each effective change is announced to every tab except the one that made it.
pub struct SharedStorage {
    backend: Box<dyn Storage>,
    changes: broadcast::Sender<StorageEvent>,
    write_lock: Mutex<()>,
}

impl SharedStorage {
    pub fn new(backend: impl Storage + 'static) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend: Box::new(backend),
            changes,
            write_lock: Mutex::new(()),
        })
    }

    /// Open a handle for a new tab.
    pub fn open_tab(self: &Arc<Self>) -> TabStorage {
        let tab = TabId::random();
        debug!(tab = %tab, "Opened tab on shared storage");
        TabStorage {
            shared: Arc::clone(self),
            tab,
        }
    }

    fn publish(&self, key: &str, new_value: Option<&str>, origin: TabId) {
        let event = StorageEvent {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
            origin,
        };
        // No receivers simply means no other tab is listening.
        let _ = self.changes.send(event);
    }
}

/// One tab's view of a [`SharedStorage`].
#[derive(Clone)]
pub struct TabStorage {
    shared: Arc<SharedStorage>,
    tab: TabId,
}

impl TabStorage {
    pub fn tab_id(&self) -> TabId {
        self.tab
    }

    /// Change notifications caused by other tabs.
    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            rx: self.shared.changes.subscribe(),
            tab: self.tab,
        }
    }
}

impl Storage for TabStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.shared.backend.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self
            .shared
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = self.shared.backend.get(key)?;
        self.shared.backend.set(key, value)?;
        if previous.as_deref() != Some(value) {
            self.shared.publish(key, Some(value), self.tab);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self
            .shared
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existed = self.shared.backend.get(key)?.is_some();
        self.shared.backend.remove(key)?;
        if existed {
            self.shared.publish(key, None, self.tab);
        }
        Ok(())
    }
}

/// Stream of storage changes made by other tabs.
pub struct StorageEvents {
    rx: broadcast::Receiver<StorageEvent>,
    tab: TabId,
}

impl StorageEvents {
    /// Next change made by another tab, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.tab => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(tab = %self.tab, skipped, "Storage change notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
