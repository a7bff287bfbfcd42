//! Client-side session management.
//!
//! Keeps a user signed in across page loads and tabs: fallback credentials in
//! durable or ephemeral storage, single-flight token refresh, transparent
//! refresh-and-retry for API calls, a session state machine and cross-tab
//! login/logout propagation. `SessionRuntime` wires it all together for one tab.

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod runtime;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testutil;

pub use api::{ApiError, ApiRequest, ApiResponse, ReqwestTransport, Transport};
pub use auth::{AuthUser, CredentialPair, CredentialStore, SessionState, StorageScope};
pub use config::{Config, SessionTimings};
pub use runtime::{HostBindings, SessionRuntime};
pub use session::{MemoryNavigator, Navigator, Notice, Notifier, SessionController, TracingNotifier};
