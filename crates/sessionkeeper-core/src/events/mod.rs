//! Session lifecycle events, in-process and across tabs.
//!
//! `EventBus` delivers `SessionEvent`s synchronously to local subscribers.
//! `CrossTabChannel` carries login/logout announcements to sibling tabs through
//! a single key in the shared durable store and re-raises them on each
//! receiving tab's bus.

pub mod bus;
pub mod cross_tab;

pub use bus::{EventBus, Handler, SessionEvent, Subscription};
pub use cross_tab::{CrossTabChannel, CrossTabMessage, AUTH_EVENT_KEY};
