use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{Storage, StorageError};

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const ACCESS_EXPIRY_KEY: &str = "access_token_expires_at";
const REFRESH_EXPIRY_KEY: &str = "refresh_token_expires_at";

const ALL_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    ACCESS_EXPIRY_KEY,
    REFRESH_EXPIRY_KEY,
];

/// Where a fallback credential pair is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    /// Survives a browser restart.
    Durable,
    /// Lives as long as the tab.
    Ephemeral,
}

impl StorageScope {
    /// Scope implied by the "remember me" choice.
    pub fn from_remember(remember: bool) -> Self {
        if remember {
            Self::Durable
        } else {
            Self::Ephemeral
        }
    }

    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Durable)
    }

    fn other(self) -> Self {
        match self {
            Self::Durable => Self::Ephemeral,
            Self::Ephemeral => Self::Durable,
        }
    }
}

/// Fallback access/refresh credentials with their expiry markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    /// Absent when only an access token was delivered (third-party callback).
    pub refresh_token: Option<String>,
    pub access_expiry: Option<DateTime<Utc>>,
    pub refresh_expiry: Option<DateTime<Utc>>,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        access_expiry: DateTime<Utc>,
        refresh_expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            access_expiry: Some(access_expiry),
            refresh_expiry: Some(refresh_expiry),
        }
    }

    pub fn access_only(access_token: impl Into<String>, access_expiry: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            access_expiry: Some(access_expiry),
            refresh_expiry: None,
        }
    }

    pub fn is_access_expired(&self) -> bool {
        self.access_expiry.is_some_and(|at| Utc::now() >= at)
    }

    /// True when the refresh token is known to be past its expiry.
    pub fn is_refresh_expired(&self) -> bool {
        self.refresh_expiry.is_some_and(|at| Utc::now() >= at)
    }
}

/// Fallback credential storage across the durable and ephemeral scopes.
///
/// A pair lives in at most one scope. Storage failures are logged and treated
/// as "nothing stored"; they never reach the caller.
pub struct CredentialStore {
    durable: Arc<dyn Storage>,
    ephemeral: Arc<dyn Storage>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(durable: Arc<dyn Storage>, ephemeral: Arc<dyn Storage>) -> Self {
        Self {
            durable,
            ephemeral,
            write_lock: Mutex::new(()),
        }
    }

    pub fn read_access_token(&self) -> Option<String> {
        self.read_key(ACCESS_TOKEN_KEY)
    }

    pub fn read_refresh_token(&self) -> Option<String> {
        self.read_key(REFRESH_TOKEN_KEY)
    }

    /// The stored pair and the scope holding it. Ephemeral wins if both are set.
    pub fn read_pair(&self) -> Option<(CredentialPair, StorageScope)> {
        [StorageScope::Ephemeral, StorageScope::Durable]
            .into_iter()
            .find_map(|scope| self.read_scope(scope).map(|pair| (pair, scope)))
    }

    pub fn scope(&self) -> Option<StorageScope> {
        self.read_pair().map(|(_, scope)| scope)
    }

    pub fn has_credentials(&self) -> bool {
        self.read_access_token().is_some()
    }

    /// Replace whatever is stored with `pair`, kept only in `scope`.
    pub(crate) fn write(&self, pair: &CredentialPair, scope: StorageScope) {
        let _guard = self.lock();
        self.write_locked(pair, scope);
    }

    /// Swap in a new access token, keeping the refresh token and scope.
    ///
    /// Returns false when no fallback pair is stored (cookie-only session),
    /// including when a clear won the race against this write.
    pub(crate) fn replace_access_token(
        &self,
        access_token: &str,
        access_expiry: DateTime<Utc>,
    ) -> bool {
        let _guard = self.lock();
        let Some((mut pair, scope)) = self.read_pair() else {
            return false;
        };
        pair.access_token = access_token.to_string();
        pair.access_expiry = Some(access_expiry);
        self.write_locked(&pair, scope);
        true
    }

    /// Remove the pair and its expiry markers from both scopes.
    pub(crate) fn clear(&self) {
        let _guard = self.lock();
        self.clear_scope(StorageScope::Ephemeral);
        self.clear_scope(StorageScope::Durable);
        debug!("Cleared fallback credentials");
    }

    fn write_locked(&self, pair: &CredentialPair, scope: StorageScope) {
        self.clear_scope(scope.other());
        self.clear_scope(scope);
        match Self::write_scope(self.storage(scope), pair) {
            Ok(()) => debug!(?scope, "Stored fallback credentials"),
            Err(e) => {
                warn!(?scope, error = %e, "Failed to store fallback credentials");
                // Never leave a half-written pair behind.
                self.clear_scope(scope);
            }
        }
    }

    fn write_scope(storage: &dyn Storage, pair: &CredentialPair) -> Result<(), StorageError> {
        storage.set(ACCESS_TOKEN_KEY, &pair.access_token)?;
        if let Some(ref refresh) = pair.refresh_token {
            storage.set(REFRESH_TOKEN_KEY, refresh)?;
        }
        if let Some(at) = pair.access_expiry {
            storage.set(ACCESS_EXPIRY_KEY, &at.timestamp_millis().to_string())?;
        }
        if let Some(at) = pair.refresh_expiry {
            storage.set(REFRESH_EXPIRY_KEY, &at.timestamp_millis().to_string())?;
        }
        Ok(())
    }

    fn read_key(&self, key: &str) -> Option<String> {
        [StorageScope::Ephemeral, StorageScope::Durable]
            .into_iter()
            .find_map(|scope| self.get(scope, key))
    }

    fn read_scope(&self, scope: StorageScope) -> Option<CredentialPair> {
        let access_token = self.get(scope, ACCESS_TOKEN_KEY)?;
        Some(CredentialPair {
            access_token,
            refresh_token: self.get(scope, REFRESH_TOKEN_KEY),
            access_expiry: self.get_timestamp(scope, ACCESS_EXPIRY_KEY),
            refresh_expiry: self.get_timestamp(scope, REFRESH_EXPIRY_KEY),
        })
    }

    fn get(&self, scope: StorageScope, key: &str) -> Option<String> {
        match self.storage(scope).get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(?scope, key, error = %e, "Credential storage unavailable");
                None
            }
        }
    }

    fn get_timestamp(&self, scope: StorageScope, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.get(scope, key)?;
        match raw.parse::<i64>().ok().and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(at) => Some(at),
            None => {
                warn!(?scope, key, "Ignoring malformed expiry marker");
                None
            }
        }
    }

    fn clear_scope(&self, scope: StorageScope) {
        let storage = self.storage(scope);
        for key in ALL_KEYS {
            if let Err(e) = storage.remove(key) {
                warn!(?scope, key, error = %e, "Failed to clear credential key");
            }
        }
    }

    fn storage(&self, scope: StorageScope) -> &dyn Storage {
        match scope {
            StorageScope::Durable => self.durable.as_ref(),
            StorageScope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
