//! Ports to the UI host: user-facing notices and navigation.

use std::sync::{Mutex, MutexGuard};

use tracing::info;
use url::Url;

/// A message the host should show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SessionExpired,
    Welcome { provider: Option<String> },
    SignedOut,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Self::SessionExpired => "Your session has expired. Please sign in again.".to_string(),
            Self::Welcome {
                provider: Some(provider),
            } => format!("Welcome! Signed in with {provider}."),
            Self::Welcome { provider: None } => "Welcome!".to_string(),
            Self::SignedOut => "You have been signed out.".to_string(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. For hosts without a UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        info!(?notice, "{}", notice.message());
    }
}

pub trait Navigator: Send + Sync {
    fn current_url(&self) -> Url;

    /// Swap the address shown to the user without navigating.
    fn replace_url(&self, url: Url);

    /// Navigate to `path` on the current origin.
    fn redirect(&self, path: &str);

    fn current_path(&self) -> String {
        self.current_url().path().to_string()
    }
}

/// Navigator that only remembers where it has been sent.
#[derive(Debug)]
pub struct MemoryNavigator {
    url: Mutex<Url>,
    redirects: Mutex<Vec<String>>,
}

impl MemoryNavigator {
    pub fn new(url: Url) -> Self {
        Self {
            url: Mutex::new(url),
            redirects: Mutex::new(Vec::new()),
        }
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    /// Paths passed to `redirect`, oldest first.
    pub fn redirects(&self) -> Vec<String> {
        lock(&self.redirects).clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_url(&self) -> Url {
        lock(&self.url).clone()
    }

    fn replace_url(&self, url: Url) {
        *lock(&self.url) = url;
    }

    fn redirect(&self, path: &str) {
        let mut url = lock(&self.url);
        if let Ok(target) = url.join(path) {
            *url = target;
        }
        lock(&self.redirects).push(path.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
