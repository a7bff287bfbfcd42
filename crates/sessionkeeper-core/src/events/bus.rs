use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Session lifecycle notifications. None of them carries a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    SessionExpired,
    /// Raised by the refresh coordinator when the refresh credential is rejected.
    Logout,
    CrossTabLogin,
    CrossTabLogout,
}

impl SessionEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::SessionExpired => "sessionExpired",
            Self::Logout => "logout",
            Self::CrossTabLogin => "crossTabLogin",
            Self::CrossTabLogout => "crossTabLogout",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type Handler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: SessionEvent,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> SessionEvent {
        self.event
    }
}

/// In-process publish/subscribe register for [`SessionEvent`]s.
///
/// Handlers run synchronously on the emitting task, in registration order.
/// The handler list is snapshotted before dispatch, so handlers may subscribe,
/// unsubscribe or emit without deadlocking.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<(Subscription, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        event: SessionEvent,
        handler: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = Subscription {
            event,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.handlers().push((subscription, Arc::new(handler)));
        subscription
    }

    /// Remove a handler. Unknown subscriptions are ignored.
    pub fn off(&self, subscription: Subscription) {
        self.handlers().retain(|(s, _)| *s != subscription);
    }

    pub fn emit(&self, event: SessionEvent) {
        let snapshot: Vec<Handler> = self
            .handlers()
            .iter()
            .filter(|(s, _)| s.event == event)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        debug!(event = %event, handlers = snapshot.len(), "Emitting session event");
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self, event: SessionEvent) -> usize {
        self.handlers().iter().filter(|(s, _)| s.event == event).count()
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(Subscription, Handler)>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
