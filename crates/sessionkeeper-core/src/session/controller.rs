use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::callback::ProviderCallback;
use super::host::{Navigator, Notice, Notifier};
use crate::api::{
    ApiError, IdentityClient, LoginRequest, RefreshCoordinator, RegisterRequest, SessionGrant,
};
use crate::auth::{AuthUser, CredentialPair, CredentialStore, SessionState, StorageScope};
use crate::config::Config;
use crate::events::{CrossTabChannel, CrossTabMessage, EventBus, SessionEvent, Subscription};

/// Collaborators the controller is wired to.
pub(crate) struct ControllerParts {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub refresh: Arc<RefreshCoordinator>,
    pub identity: IdentityClient,
    pub bus: Arc<EventBus>,
    pub cross_tab: CrossTabChannel,
    pub notifier: Arc<dyn Notifier>,
    pub navigator: Arc<dyn Navigator>,
}

/// Owns the session state machine for one tab.
///
/// State moves out of `Unknown` once, at startup, and afterwards only between
/// `Authenticated` and `Unauthenticated`. Clones share the same state.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    parts: ControllerParts,
    state: watch::Sender<SessionState>,
    user: Mutex<Option<AuthUser>>,
    /// Held from the first expiry notification until its redirect is issued.
    expiry_guard: AtomicBool,
    logout_guard: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Clears a latch when dropped, so an abandoned operation cannot leave it set.
struct Latch<'a>(&'a AtomicBool);

impl<'a> Latch<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for Latch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionController {
    pub(crate) fn new(parts: ControllerParts) -> Self {
        let (state, _) = watch::channel(SessionState::Unknown);
        Self {
            inner: Arc::new(Inner {
                parts,
                state,
                user: Mutex::new(None),
                expiry_guard: AtomicBool::new(false),
                logout_guard: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        lock(&self.inner.user).clone()
    }

    /// Re-run startup validation. Resolves within the startup window even if
    /// the server does not answer; a late answer still updates the state.
    pub async fn check_auth(&self) -> SessionState {
        self.inner.check_auth().await
    }

    pub async fn login(&self, identifier: &str, password: &str, remember: bool) -> bool {
        match self.try_login(identifier, password, remember).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                false
            }
        }
    }

    pub async fn try_login(
        &self,
        identifier: &str,
        password: &str,
        remember: bool,
    ) -> Result<AuthUser, ApiError> {
        let request = LoginRequest {
            identifier: identifier.to_string(),
            password: password.to_string(),
            remember_me: remember,
        };
        let grant = self.inner.parts.identity.login(&request).await?;
        Ok(self.inner.adopt_grant(grant, remember))
    }

    pub async fn register(&self, request: RegisterRequest) -> bool {
        match self.try_register(request).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Registration failed");
                false
            }
        }
    }

    pub async fn try_register(&self, request: RegisterRequest) -> Result<AuthUser, ApiError> {
        let remember = request.remember_me;
        let grant = self.inner.parts.identity.register(&request).await?;
        Ok(self.inner.adopt_grant(grant, remember))
    }

    /// End the session here and in every other tab. Always succeeds locally.
    pub async fn logout(&self) {
        let inner = &self.inner;
        let Some(_latch) = Latch::acquire(&inner.logout_guard) else {
            debug!("Logout already in progress");
            return;
        };

        let bearer = if inner.parts.config.cookie_auth {
            None
        } else {
            inner.parts.credentials.read_access_token()
        };
        inner.parts.identity.logout(bearer).await;

        inner.sign_out_locally();
        inner.parts.cross_tab.broadcast(CrossTabMessage::Logout);
        inner.parts.notifier.notify(Notice::SignedOut);
    }

    /// Drop the local session without contacting the server or other tabs.
    pub fn force_logout(&self) {
        self.inner.sign_out_locally();
    }

    /// Run one health check: verify, then refresh quietly if the session is
    /// no longer valid. Skipped unless authenticated.
    pub async fn health_check(&self) {
        let inner = &self.inner;
        if !inner.state.borrow().is_authenticated() {
            return;
        }
        if inner.parts.refresh.verify_session().await {
            debug!("Health check passed");
            return;
        }
        let outcome = inner.parts.refresh.refresh_quietly().await;
        info!(?outcome, "Health check found an invalid session");
    }

    /// Start reacting to bus events. Calling twice has no effect.
    pub(crate) fn attach(&self) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }
        let bus = &self.inner.parts.bus;

        for event in [SessionEvent::SessionExpired, SessionEvent::Logout] {
            let weak = Arc::downgrade(&self.inner);
            subscriptions.push(bus.on(event, move |_| with_inner(&weak, |inner| inner.expire())));
        }

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(bus.on(SessionEvent::CrossTabLogin, move |_| {
            with_inner(&weak, |inner| {
                tokio::spawn(async move {
                    inner.check_auth().await;
                });
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(bus.on(SessionEvent::CrossTabLogout, move |_| {
            with_inner(&weak, |inner| {
                info!("Signed out in another tab");
                inner.sign_out_locally();
            })
        }));
    }

    pub(crate) fn detach(&self) {
        let subscriptions = std::mem::take(&mut *lock(&self.inner.subscriptions));
        for subscription in subscriptions {
            self.inner.parts.bus.off(subscription);
        }
    }
}

impl Inner {
    async fn check_auth(self: &Arc<Self>) -> SessionState {
        let validation = tokio::spawn(Arc::clone(self).validate());
        let window = self.parts.config.timings.startup_timeout();

        match tokio::time::timeout(window, validation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Session validation task failed");
                self.settle_unknown();
            }
            Err(_) => {
                if self.settle_unknown() {
                    warn!(
                        timeout_ms = window.as_millis() as u64,
                        "Session validation timed out, continuing signed out"
                    );
                }
            }
        }
        *self.state.borrow()
    }

    async fn validate(self: Arc<Self>) {
        let url = self.parts.navigator.current_url();
        if let Some((callback, cleaned)) = ProviderCallback::take(&url) {
            self.complete_provider_sign_in(callback, cleaned).await;
            return;
        }

        if self.parts.refresh.verify_session().await || self.restore().await {
            if !self.adopt_session().await {
                debug!("Verified session is unusable, dropping it");
                self.sign_out_locally();
            }
        } else {
            *lock(&self.user) = None;
            self.set_state(SessionState::Unauthenticated);
        }
    }

    async fn complete_provider_sign_in(&self, callback: ProviderCallback, cleaned: url::Url) {
        self.parts.navigator.replace_url(cleaned);
        info!(provider = ?callback.provider, "Completing third-party sign-in");

        if let Some(token) = callback.token {
            let expiry = Utc::now() + self.parts.config.timings.access_token_ttl();
            self.parts
                .credentials
                .write(&CredentialPair::access_only(token, expiry), StorageScope::Durable);
        }

        if self.parts.refresh.verify_session().await && self.adopt_session().await {
            self.parts.notifier.notify(Notice::Welcome {
                provider: callback.provider,
            });
            self.parts.cross_tab.broadcast(CrossTabMessage::Login);
        } else {
            warn!("Third-party sign-in could not be verified");
            self.sign_out_locally();
        }
    }

    /// Try to revive a session the server no longer accepts from leftover
    /// fallback credentials. Leftovers that cannot be refreshed are dropped.
    async fn restore(&self) -> bool {
        match self.parts.credentials.read_pair() {
            Some((pair, _)) if pair.refresh_token.is_some() && !pair.is_refresh_expired() => {
                self.parts.refresh.refresh_quietly().await.is_refreshed()
                    && self.parts.refresh.verify_session().await
            }
            Some(_) => {
                debug!("Clearing unusable fallback credentials");
                self.parts.credentials.clear();
                false
            }
            None => false,
        }
    }

    /// Fetch the identity behind a verified session and move to `Authenticated`.
    /// Returns false if the session turned out to be unusable.
    async fn adopt_session(&self) -> bool {
        let user = match self.parts.identity.current_user().await {
            Ok(user) => Some(user),
            Err(ApiError::Unauthorized) => {
                info!("Session rejected while loading the current user");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Could not load the current user");
                None
            }
        };
        let persistent = self
            .parts
            .credentials
            .scope()
            .map_or(true, StorageScope::is_persistent);
        *lock(&self.user) = user;
        self.set_state(SessionState::Authenticated { persistent });
        true
    }

    fn adopt_grant(&self, grant: SessionGrant, remember: bool) -> AuthUser {
        match grant.credential_pair(&self.parts.config.timings) {
            Some(pair) => self
                .parts
                .credentials
                .write(&pair, StorageScope::from_remember(remember)),
            None => self.parts.credentials.clear(),
        }
        *lock(&self.user) = Some(grant.user.clone());
        self.set_state(SessionState::Authenticated { persistent: remember });
        self.parts.cross_tab.broadcast(CrossTabMessage::Login);
        grant.user
    }

    fn sign_out_locally(&self) {
        self.parts.credentials.clear();
        *lock(&self.user) = None;
        self.set_state(SessionState::Unauthenticated);
    }

    /// Expiry path: sign out now, then notify and redirect once per episode.
    fn expire(self: Arc<Self>) {
        self.sign_out_locally();

        if self
            .expiry_guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Session expiry already being handled");
            return;
        }

        warn!("Session expired");
        self.parts.notifier.notify(Notice::SessionExpired);

        let delay = self.parts.config.timings.expiry_redirect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let sign_in = &self.parts.config.sign_in_path;
            if self.parts.navigator.current_path() != *sign_in {
                self.parts.navigator.redirect(sign_in);
            }
            self.expiry_guard.store(false, Ordering::SeqCst);
        });
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "Session state changed");
        }
    }

    /// Leave `Unknown` for `Unauthenticated`. True if the state changed.
    fn settle_unknown(&self) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_resolved() {
                false
            } else {
                *current = SessionState::Unauthenticated;
                true
            }
        })
    }
}

fn with_inner(weak: &Weak<Inner>, f: impl FnOnce(Arc<Inner>)) {
    if let Some(inner) = weak.upgrade() {
        f(inner);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
