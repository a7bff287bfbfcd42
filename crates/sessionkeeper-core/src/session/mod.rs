//! Session lifecycle for one tab.
//!
//! `SessionController` drives the `Unknown`/`Authenticated`/`Unauthenticated`
//! state machine: startup validation (including third-party sign-in
//! callbacks), login, registration, logout, expiry handling and reactions to
//! other tabs. The host is reached through the `Notifier` and `Navigator` ports.

pub mod callback;
pub mod controller;
pub(crate) mod health;
pub mod host;

pub use callback::ProviderCallback;
pub use controller::SessionController;
pub use host::{MemoryNavigator, Navigator, Notice, Notifier, TracingNotifier};
