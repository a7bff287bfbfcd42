//! HTTP side of session management.
//!
//! This module provides:
//! - `Transport`: the port every outgoing call goes through, with a reqwest adapter
//! - `RefreshCoordinator`: single-flight token refresh and session verification
//! - `RequestPipeline`: credential attachment, 429 backoff and the one-time
//!   refresh-and-retry on 401
//! - `IdentityClient`: login, registration, logout and the current user

pub mod client;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod single_flight;
pub mod transport;

pub use client::{IdentityClient, LoginRequest, RegisterRequest, SessionGrant};
pub use error::ApiError;
pub use pipeline::RequestPipeline;
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use single_flight::SingleFlight;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};

/// Endpoint paths, relative to the API base URL.
pub mod paths {
    pub const LOGIN: &str = "/login";
    pub const REGISTER: &str = "/register";
    pub const LOGOUT: &str = "/logout";
    pub const REFRESH: &str = "/refresh";
    pub const VERIFY_SESSION: &str = "/verify-session";
    pub const CURRENT_USER: &str = "/current-user";
}
