//! Authentication data: fallback credentials and session state.
//!
//! This module provides:
//! - `CredentialStore`: the fallback token pair across durable/ephemeral scopes
//! - `SessionState`: the `Unknown`/`Authenticated`/`Unauthenticated` state
//! - `AuthUser`: the identity of the signed-in user
//!
//! Primary credentials live in server-managed cookies; the store only holds
//! the fallback pair for contexts where those cookies are not available.

pub mod credentials;
pub mod state;

pub use credentials::{CredentialPair, CredentialStore, StorageScope};
pub use state::{AuthUser, SessionState};
