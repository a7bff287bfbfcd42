use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::{
    paths, ApiError, ApiRequest, ApiResponse, RefreshCoordinator, RefreshOutcome, Transport,
};
use crate::auth::CredentialStore;
use crate::config::Config;
use crate::events::{EventBus, SessionEvent};

/// Ceiling for the rate-limit backoff
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Wraps every business call with credential handling.
///
/// A request that comes back 401 triggers one shared refresh and is re-issued
/// once. Requests that carry their own bearer are never refreshed: the
/// caller's credential wins. Rate-limited requests are retried with
/// exponential backoff.
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    bus: Arc<EventBus>,
    cookie_auth: bool,
    max_rate_limit_retries: u32,
    initial_backoff: Duration,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        refresh: Arc<RefreshCoordinator>,
        bus: Arc<EventBus>,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            credentials,
            refresh,
            bus,
            cookie_auth: config.cookie_auth,
            max_rate_limit_retries: config.timings.max_rate_limit_retries,
            initial_backoff: config.timings.initial_backoff(),
        }
    }

    /// Send `request`, refreshing and retrying once on an authorization failure.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retried = false;

        loop {
            // Credentials are read per attempt so a retry picks up the refreshed token.
            let prepared = self.prepare(&request);
            let response = self.send_with_backoff(&prepared).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return response.into_result();
            }

            if request.path == paths::REFRESH {
                warn!("Refresh endpoint answered 401");
                self.credentials.clear();
                self.bus.emit(SessionEvent::SessionExpired);
                return Err(ApiError::Unauthorized);
            }

            if request.bearer.is_some() {
                info!(path = %request.path, "Caller-supplied credential rejected");
                return Err(ApiError::Unauthorized);
            }

            if retried {
                info!(path = %request.path, "Still unauthorized after refresh");
                return Err(ApiError::Unauthorized);
            }
            retried = true;

            match self.refresh.refresh().await {
                RefreshOutcome::Refreshed => {
                    debug!(path = %request.path, "Retrying after refresh");
                }
                RefreshOutcome::Rejected => {
                    self.bus.emit(SessionEvent::SessionExpired);
                    return Err(ApiError::Unauthorized);
                }
                RefreshOutcome::Unreachable => {
                    return Err(ApiError::Network("Could not refresh session".to_string()));
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.send(ApiRequest::post(path, body)).await?.json()
    }

    fn prepare(&self, request: &ApiRequest) -> ApiRequest {
        let mut prepared = request.clone();
        if !self.cookie_auth && prepared.bearer.is_none() {
            prepared.bearer = self.credentials.read_access_token();
        }
        prepared
    }

    async fn send_with_backoff(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.transport.send(request).await?;
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > self.max_rate_limit_retries {
                return Err(ApiError::RateLimited);
            }
            warn!(
                path = %request.path,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF); // Exponential backoff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StorageScope;
    use crate::storage::MemoryStorage;
    use crate::testutil::FakeServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        server: Arc<FakeServer>,
        credentials: Arc<CredentialStore>,
        expired: Arc<AtomicUsize>,
        pipeline: Arc<RequestPipeline>,
    }

    fn fixture(config: Config, latency: Duration) -> Fixture {
        let server = FakeServer::with_latency(latency);
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        ));
        let bus = Arc::new(EventBus::new());
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        bus.on(SessionEvent::SessionExpired, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let refresh = Arc::new(RefreshCoordinator::new(
            server.clone(),
            Arc::clone(&credentials),
            Arc::clone(&bus),
            config.cookie_auth,
            config.timings.access_token_ttl(),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            server.clone(),
            Arc::clone(&credentials),
            refresh,
            bus,
            &config,
        ));
        Fixture {
            server,
            credentials,
            expired,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_attaches_stored_credential() {
        let f = fixture(Config::default(), Duration::ZERO);
        let pair = f.server.issue_session("ada");
        f.credentials.write(&pair, StorageScope::Durable);

        let response = f.pipeline.send(ApiRequest::get("/chats")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(f.server.calls()[0].bearer.as_deref(), Some(pair.access_token.as_str()));
    }

    #[tokio::test]
    async fn test_cookie_mode_never_attaches_bearer() {
        let config = Config {
            cookie_auth: true,
            ..Config::default()
        };
        let f = fixture(config, Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);

        let _ = f.pipeline.send(ApiRequest::get("/chats")).await;
        assert!(f.server.calls().iter().all(|call| call.bearer.is_none()));
    }

    #[tokio::test]
    async fn test_expired_access_is_refreshed_and_retried() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);
        f.server.expire_access_tokens();

        let value: serde_json::Value = f.pipeline.get_json("/chats").await.unwrap();
        assert_eq!(value["path"], "/chats");

        let calls = f.server.calls();
        let visited: Vec<_> = calls.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(visited, vec!["/chats", paths::REFRESH, "/chats"]);
        assert_ne!(calls[0].bearer, calls[2].bearer);
        assert_eq!(f.expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_final() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);
        f.server.always_unauthorized(true);

        let result = f.pipeline.send(ApiRequest::get("/chats")).await;

        assert_eq!(result, Err(ApiError::Unauthorized));
        assert_eq!(f.server.calls_to(paths::REFRESH), 1);
        assert_eq!(f.server.calls_to("/chats"), 2);
        assert_eq!(f.expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_refresh_once() {
        let f = fixture(Config::default(), Duration::from_millis(30));
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);
        f.server.expire_access_tokens();

        let requests = (0..5).map(|i| {
            let pipeline = Arc::clone(&f.pipeline);
            async move { pipeline.send(ApiRequest::get(format!("/chats/{i}"))).await }
        });
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(f.server.calls_to(paths::REFRESH), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_routes_to_expiry() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);
        f.server.expire_access_tokens();
        f.server.reject_refresh(true);

        let result = f.pipeline.send(ApiRequest::get("/chats")).await;

        assert_eq!(result, Err(ApiError::Unauthorized));
        assert!(!f.credentials.has_credentials());
        assert_eq!(f.expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refresh_call_is_not_retried() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);
        f.server.reject_refresh(true);

        let result = f
            .pipeline
            .send(ApiRequest::post(paths::REFRESH, serde_json::json!({})))
            .await;

        assert_eq!(result, Err(ApiError::Unauthorized));
        assert_eq!(f.server.calls_to(paths::REFRESH), 1);
        assert!(!f.credentials.has_credentials());
        assert_eq!(f.expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);

        f.server.rate_limit(2);
        let start = tokio::time::Instant::now();
        assert!(f.pipeline.send(ApiRequest::get("/chats")).await.is_ok());
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));

        f.server.rate_limit(10);
        assert_eq!(
            f.pipeline.send(ApiRequest::get("/chats")).await,
            Err(ApiError::RateLimited)
        );
        assert_eq!(f.server.calls_to("/chats"), 3 + 4);
    }

    #[tokio::test]
    async fn test_caller_bearer_is_not_refreshed() {
        let f = fixture(Config::default(), Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);

        let request = ApiRequest::get("/chats").with_bearer("stale-token");
        assert_eq!(f.pipeline.send(request).await, Err(ApiError::Unauthorized));

        assert_eq!(f.server.calls_to(paths::REFRESH), 0);
        assert_eq!(f.server.calls_to("/chats"), 1);
        assert!(f.credentials.has_credentials());
        assert_eq!(f.expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let mut config = Config::default();
        config.timings.max_rate_limit_retries = 80;
        let f = fixture(config, Duration::ZERO);
        f.credentials.write(&f.server.issue_session("ada"), StorageScope::Durable);

        f.server.rate_limit(80);
        let start = tokio::time::Instant::now();
        assert!(f.pipeline.send(ApiRequest::get("/chats")).await.is_ok());

        // 1 + 2 + ... + 32, then 74 waits at the ceiling
        let expected = Duration::from_secs(63) + MAX_BACKOFF * 74;
        let elapsed = start.elapsed();
        assert!(elapsed >= expected && elapsed < expected + Duration::from_secs(1));
    }
}
