//! Identity endpoints: sign-in, registration, sign-out and the current user.
//!
//! Sign-in and registration bypass the request pipeline: a 401 there means
//! bad credentials, not an expired session, and must never trigger a refresh.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{paths, ApiError, ApiRequest, RequestPipeline, Transport};
use crate::auth::{AuthUser, CredentialPair};
use crate::config::SessionTimings;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Username or email
    pub identifier: String,
    pub password: String,
    pub remember_me: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub remember_me: bool,
}

/// What the server hands back after a successful sign-in or registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub user: AuthUser,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Seconds
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
}

impl SessionGrant {
    /// The fallback credential pair carried by this grant, if the server sent
    /// one. Missing lifetimes fall back to the configured defaults.
    pub fn credential_pair(&self, timings: &SessionTimings) -> Option<CredentialPair> {
        let access_token = self.access_token.clone()?;
        let now = Utc::now();
        let access_expiry = now
            + self
                .expires_in
                .map(chrono::Duration::seconds)
                .unwrap_or(timings.access_token_ttl());

        let pair = match self.refresh_token {
            Some(ref refresh_token) => {
                let refresh_expiry = now
                    + self
                        .refresh_expires_in
                        .map(chrono::Duration::seconds)
                        .unwrap_or(timings.refresh_token_ttl());
                CredentialPair::new(
                    access_token,
                    refresh_token.clone(),
                    access_expiry,
                    refresh_expiry,
                )
            }
            None => CredentialPair::access_only(access_token, access_expiry),
        };
        Some(pair)
    }
}

pub struct IdentityClient {
    transport: Arc<dyn Transport>,
    pipeline: Arc<RequestPipeline>,
}

impl IdentityClient {
    pub fn new(transport: Arc<dyn Transport>, pipeline: Arc<RequestPipeline>) -> Self {
        Self { transport, pipeline }
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<SessionGrant, ApiError> {
        debug!(identifier = %request.identifier, "Signing in");
        self.authenticate(paths::LOGIN, request).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<SessionGrant, ApiError> {
        debug!(username = %request.username, "Registering");
        self.authenticate(paths::REGISTER, request).await
    }

    /// Tell the server to end the session. Best effort: failures are logged
    /// and otherwise ignored.
    pub async fn logout(&self, bearer: Option<String>) {
        let mut request = ApiRequest::post(paths::LOGOUT, serde_json::json!({}));
        if let Some(token) = bearer {
            request = request.with_bearer(token);
        }
        match self.transport.send(&request).await {
            Ok(response) if response.is_success() => info!("Server session ended"),
            Ok(response) => warn!(status = %response.status, "Logout call refused, continuing"),
            Err(e) => warn!(error = %e, "Logout call failed, continuing"),
        }
    }

    pub async fn current_user(&self) -> Result<AuthUser, ApiError> {
        self.pipeline.get_json(paths::CURRENT_USER).await
    }

    async fn authenticate<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<SessionGrant, ApiError> {
        let request = ApiRequest::post(path, serde_json::to_value(body)?);
        let grant: SessionGrant = self.transport.send(&request).await?.into_result()?.json()?;
        info!(user = %grant.user.username, "Authenticated");
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RefreshCoordinator;
    use crate::auth::{CredentialStore, StorageScope};
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::storage::MemoryStorage;
    use crate::testutil::{FakeServer, PASSWORD};
    use serde_json::json;

    fn client(server: &Arc<FakeServer>) -> (IdentityClient, Arc<CredentialStore>) {
        let config = Config::default();
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        ));
        let bus = Arc::new(EventBus::new());
        let refresh = Arc::new(RefreshCoordinator::new(
            server.clone(),
            Arc::clone(&credentials),
            Arc::clone(&bus),
            false,
            config.timings.access_token_ttl(),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            server.clone(),
            Arc::clone(&credentials),
            refresh,
            bus,
            &config,
        ));
        (IdentityClient::new(server.clone(), pipeline), credentials)
    }

    fn login_request(password: &str) -> LoginRequest {
        LoginRequest {
            identifier: "ada".to_string(),
            password: password.to_string(),
            remember_me: true,
        }
    }

    #[tokio::test]
    async fn test_login_returns_grant() {
        let server = FakeServer::new();
        let (client, _) = client(&server);

        let grant = client.login(&login_request(PASSWORD)).await.unwrap();
        assert_eq!(grant.user.username, "ada");

        let pair = grant.credential_pair(&SessionTimings::default()).unwrap();
        assert!(server.is_valid_access(&pair.access_token));
        assert!(pair.refresh_token.is_some());
        assert!(!pair.is_access_expired());

        let calls = server.calls();
        let call = &calls[0];
        assert_eq!(call.method, reqwest::Method::POST);
        assert_eq!(call.body.as_ref().unwrap()["rememberMe"], json!(true));
    }

    #[tokio::test]
    async fn test_bad_password_never_refreshes() {
        let server = FakeServer::new();
        let (client, _) = client(&server);

        let result = client.login(&login_request("wrong")).await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(server.calls_to(paths::REFRESH), 0);
    }

    #[tokio::test]
    async fn test_register_omits_missing_display_name() {
        let server = FakeServer::new();
        let (client, _) = client(&server);
        let request = RegisterRequest {
            username: "grace".to_string(),
            email: "grace@example.com".to_string(),
            password: "anything".to_string(),
            display_name: None,
            remember_me: false,
        };

        let grant = client.register(&request).await.unwrap();
        assert_eq!(grant.user.username, "grace");
        let body = server.calls()[0].body.clone().unwrap();
        assert!(body.get("displayName").is_none());
    }

    #[tokio::test]
    async fn test_current_user_uses_stored_credential() {
        let server = FakeServer::new();
        let (client, credentials) = client(&server);
        assert_eq!(client.current_user().await, Err(ApiError::Unauthorized));

        credentials.write(&server.issue_session("ada"), StorageScope::Durable);
        let user = client.current_user().await.unwrap();
        assert_eq!(user.id, "u-ada");
    }

    #[tokio::test]
    async fn test_logout_ignores_network_failure() {
        let server = FakeServer::new();
        let (client, _) = client(&server);
        server.set_offline(true);

        client.logout(Some("access-1".to_string())).await;
        assert_eq!(server.calls_to(paths::LOGOUT), 1);
    }

    #[test]
    fn test_grant_without_refresh_token() {
        let grant: SessionGrant = serde_json::from_value(json!({
            "user": {"id": "u-1", "username": "ada"},
            "accessToken": "only-access"
        }))
        .unwrap();
        let pair = grant.credential_pair(&SessionTimings::default()).unwrap();
        assert_eq!(pair.refresh_token, None);
        assert_eq!(pair.refresh_expiry, None);

        let cookie_only: SessionGrant =
            serde_json::from_value(json!({"user": {"id": "u-1", "username": "ada"}})).unwrap();
        assert!(cookie_only.credential_pair(&SessionTimings::default()).is_none());
    }
}
