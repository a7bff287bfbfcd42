use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{paths, ApiError, ApiRequest, SingleFlight, Transport};
use crate::auth::CredentialStore;
use crate::events::{EventBus, SessionEvent};

/// How a refresh attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new access credential is in place.
    Refreshed,
    /// The server (or a known-expired refresh token) refused. Fallback
    /// credentials have been cleared.
    Rejected,
    /// No usable answer arrived. Nothing was cleared.
    Unreachable,
}

impl RefreshOutcome {
    pub fn is_refreshed(self) -> bool {
        self == Self::Refreshed
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    success: bool,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

struct Refresher {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    bus: Arc<EventBus>,
    access_ttl: chrono::Duration,
}

/// Guarantees at most one refresh call is outstanding at a time.
///
/// Callers arriving while a refresh runs share its outcome, including its
/// announce mode: whoever started the flight decides whether a rejection
/// emits `logout`.
pub struct RefreshCoordinator {
    refresher: Arc<Refresher>,
    flight: SingleFlight<RefreshOutcome>,
    cookie_auth: bool,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        bus: Arc<EventBus>,
        cookie_auth: bool,
        access_ttl: chrono::Duration,
    ) -> Self {
        Self {
            refresher: Arc::new(Refresher {
                transport,
                credentials,
                bus,
                access_ttl,
            }),
            flight: SingleFlight::new(),
            cookie_auth,
        }
    }

    /// Ask the server whether the current session is valid. Never fails:
    /// any error or non-2xx status means "not valid".
    pub async fn verify_session(&self) -> bool {
        let mut request = ApiRequest::get(paths::VERIFY_SESSION);
        if !self.cookie_auth {
            if let Some(token) = self.refresher.credentials.read_access_token() {
                request = request.with_bearer(token);
            }
        }

        match self.refresher.transport.send(&request).await {
            Ok(response) if response.is_success() => match response.json::<VerifyResponse>() {
                Ok(verdict) => verdict.valid,
                Err(_) => true,
            },
            Ok(response) => {
                debug!(status = %response.status, "Session verification refused");
                false
            }
            Err(e) => {
                debug!(error = %e, "Session verification failed");
                false
            }
        }
    }

    /// Obtain a new access credential. True only when one is now in place.
    pub async fn refresh_access_token(&self) -> bool {
        self.refresh().await.is_refreshed()
    }

    /// Refresh, emitting `logout` on the bus if the server rejects.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.start(true).await
    }

    /// Refresh without announcing a rejection. Used by background checks.
    pub async fn refresh_quietly(&self) -> RefreshOutcome {
        self.start(false).await
    }

    pub fn in_flight(&self) -> bool {
        self.flight.in_flight()
    }

    async fn start(&self, announce: bool) -> RefreshOutcome {
        let refresher = Arc::clone(&self.refresher);
        self.flight
            .run(move || async move { refresher.run(announce).await })
            .await
            .unwrap_or(RefreshOutcome::Unreachable)
    }
}

impl Refresher {
    async fn run(&self, announce: bool) -> RefreshOutcome {
        let outcome = self.attempt().await;
        if outcome == RefreshOutcome::Rejected {
            self.credentials.clear();
            if announce {
                self.bus.emit(SessionEvent::Logout);
            }
        }
        info!(?outcome, announce, "Token refresh finished");
        outcome
    }

    async fn attempt(&self) -> RefreshOutcome {
        let stored = self.credentials.read_pair();
        if let Some((pair, _)) = stored.as_ref() {
            if pair.is_refresh_expired() {
                info!("Fallback refresh token expired, not contacting server");
                return RefreshOutcome::Rejected;
            }
        }

        let body = match stored.and_then(|(pair, _)| pair.refresh_token) {
            Some(token) => json!({ "refreshToken": token }),
            None => json!({}),
        };
        let request = ApiRequest::post(paths::REFRESH, body);

        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Refresh request did not reach the server");
                return RefreshOutcome::Unreachable;
            }
        };

        let status = response.status;
        if ApiError::from_status(status, &response.body).is_transient() {
            warn!(status = %status, "Refresh endpoint temporarily unavailable");
            return RefreshOutcome::Unreachable;
        }
        if !response.is_success() {
            info!(status = %status, "Refresh rejected");
            return RefreshOutcome::Rejected;
        }

        let parsed: RefreshResponse = match response.json() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Unreadable refresh response");
                return RefreshOutcome::Unreachable;
            }
        };
        if !parsed.success {
            info!("Refresh refused by server");
            return RefreshOutcome::Rejected;
        }

        if let Some(token) = parsed.access_token {
            let ttl = parsed
                .expires_in
                .map(chrono::Duration::seconds)
                .unwrap_or(self.access_ttl);
            if self.credentials.replace_access_token(&token, Utc::now() + ttl) {
                debug!("Stored refreshed access token");
            }
        }
        RefreshOutcome::Refreshed
    }
}
