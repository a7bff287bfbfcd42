//! In-process doubles for the identity server and the UI host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use crate::api::{paths, ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::CredentialPair;
use crate::session::{Notice, Notifier};

pub(crate) const PASSWORD: &str = "correct horse";

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct ServerState {
    issued: u32,
    /// access token -> username
    access: HashMap<String, String>,
    /// refresh token -> username
    refresh: HashMap<String, String>,
    offline: bool,
    reject_refresh: bool,
    always_unauthorized: bool,
    reject_current_user: bool,
    rate_limited_responses: u32,
}

impl ServerState {
    fn issue(&mut self, username: &str) -> (String, String) {
        self.issued += 1;
        let access = format!("access-{}", self.issued);
        let refresh = format!("refresh-{}", self.issued);
        self.access.insert(access.clone(), username.to_string());
        self.refresh.insert(refresh.clone(), username.to_string());
        (access, refresh)
    }
}

/// Identity server living inside the test process.
///
/// Session validity is tracked per bearer token; cookies are not simulated.
pub(crate) struct FakeServer {
    latency: Duration,
    state: Mutex<ServerState>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            state: Mutex::new(ServerState::default()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn reject_refresh(&self, reject: bool) {
        self.state.lock().unwrap().reject_refresh = reject;
    }

    /// Business endpoints answer 401 whatever credential is presented.
    pub fn always_unauthorized(&self, on: bool) {
        self.state.lock().unwrap().always_unauthorized = on;
    }

    /// `/current-user` answers 401 even though the session verifies.
    pub fn reject_current_user(&self, on: bool) {
        self.state.lock().unwrap().reject_current_user = on;
    }

    /// The next `count` business or refresh calls answer 429.
    pub fn rate_limit(&self, count: u32) {
        self.state.lock().unwrap().rate_limited_responses = count;
    }

    /// Invalidate every access token; refresh tokens stay valid.
    pub fn expire_access_tokens(&self) {
        self.state.lock().unwrap().access.clear();
    }

    /// Mint a valid session for `username` without going through `/login`.
    pub fn issue_session(&self, username: &str) -> CredentialPair {
        let (access, refresh) = self.state.lock().unwrap().issue(username);
        let now = Utc::now();
        CredentialPair::new(
            access,
            refresh,
            now + chrono::Duration::minutes(15),
            now + chrono::Duration::days(7),
        )
    }

    pub fn is_valid_access(&self, token: &str) -> bool {
        self.state.lock().unwrap().access.contains_key(token)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.path == path).count()
    }

    fn handle(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(ApiError::Network("connection refused".to_string()));
        }

        let body = request.body.clone().unwrap_or(Value::Null);
        let session_user = request
            .bearer
            .as_ref()
            .and_then(|token| state.access.get(token).cloned());

        let response = match (request.method.as_str(), request.path.as_str()) {
            ("POST", paths::LOGIN) => {
                if body["password"] != PASSWORD {
                    respond(StatusCode::UNAUTHORIZED, json!({"error": "invalid credentials"}))
                } else {
                    let username = body["identifier"].as_str().unwrap_or("anonymous").to_string();
                    session_response(&mut state, &username)
                }
            }
            ("POST", paths::REGISTER) => {
                let username = body["username"].as_str().unwrap_or("anonymous").to_string();
                session_response(&mut state, &username)
            }
            ("POST", paths::LOGOUT) => {
                if let Some(ref token) = request.bearer {
                    state.access.remove(token);
                }
                respond(StatusCode::OK, json!({}))
            }
            ("GET", paths::VERIFY_SESSION) => {
                respond(StatusCode::OK, json!({"valid": session_user.is_some()}))
            }
            ("GET", paths::CURRENT_USER) => match session_user {
                Some(username) if !state.reject_current_user => {
                    respond(StatusCode::OK, user_json(&username))
                }
                _ => respond(StatusCode::UNAUTHORIZED, json!({"error": "not signed in"})),
            },
            ("POST", paths::REFRESH) if state.rate_limited_responses > 0 => {
                state.rate_limited_responses -= 1;
                respond(StatusCode::TOO_MANY_REQUESTS, json!({}))
            }
            ("POST", paths::REFRESH) => {
                let owner = body["refreshToken"]
                    .as_str()
                    .and_then(|token| state.refresh.get(token).cloned());
                match owner {
                    Some(username) if !state.reject_refresh => {
                        state.issued += 1;
                        let access = format!("access-{}", state.issued);
                        state.access.insert(access.clone(), username);
                        respond(
                            StatusCode::OK,
                            json!({"success": true, "accessToken": access, "expiresIn": 900}),
                        )
                    }
                    _ => respond(StatusCode::UNAUTHORIZED, json!({"success": false})),
                }
            }
            (_, path) => {
                if state.rate_limited_responses > 0 {
                    state.rate_limited_responses -= 1;
                    respond(StatusCode::TOO_MANY_REQUESTS, json!({}))
                } else if state.always_unauthorized || session_user.is_none() {
                    respond(StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"}))
                } else {
                    respond(StatusCode::OK, json!({"ok": true, "path": path}))
                }
            }
        };
        Ok(response)
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method.clone(),
            path: request.path.clone(),
            bearer: request.bearer.clone(),
            body: request.body.clone(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.handle(request)
    }
}

fn respond(status: StatusCode, body: Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

fn user_json(username: &str) -> Value {
    json!({"id": format!("u-{username}"), "username": username})
}

fn session_response(state: &mut ServerState, username: &str) -> ApiResponse {
    let (access, refresh) = state.issue(username);
    respond(
        StatusCode::OK,
        json!({
            "user": user_json(username),
            "accessToken": access,
            "refreshToken": refresh,
            "expiresIn": 900,
            "refreshExpiresIn": 604800,
        }),
    )
}

/// Notifier that remembers everything it was asked to show.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count(&self, notice: &Notice) -> usize {
        self.notices.lock().unwrap().iter().filter(|n| *n == notice).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}
