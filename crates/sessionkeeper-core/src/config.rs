//! Application configuration management.
//!
//! This module handles loading and saving the session configuration,
//! which includes the API base URL, the cookie/fallback credential mode,
//! the default "remember me" choice and the lifecycle timings.
//!
//! Configuration is stored at `~/.config/sessionkeeper/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_SIGN_IN_PATH: &str = "/login";

const ENV_API_URL: &str = "SESSIONKEEPER_API_URL";
const ENV_COOKIE_AUTH: &str = "SESSIONKEEPER_COOKIE_AUTH";
const ENV_USERNAME: &str = "SESSIONKEEPER_USERNAME";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// When true the transport relies on the server-set session cookie and
    /// no fallback bearer token is attached to outgoing requests.
    #[serde(default)]
    pub cookie_auth: bool,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(default)]
    pub last_username: Option<String>,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    #[serde(default)]
    pub timings: SessionTimings,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_sign_in_path() -> String {
    DEFAULT_SIGN_IN_PATH.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            cookie_auth: false,
            remember_me: false,
            last_username: None,
            sign_in_path: default_sign_in_path(),
            timings: SessionTimings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from `SESSIONKEEPER_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(raw) = lookup(ENV_COOKIE_AUTH) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.cookie_auth = true,
                "0" | "false" | "no" | "off" => self.cookie_auth = false,
                other => warn!(value = %other, "Ignoring unrecognized {}", ENV_COOKIE_AUTH),
            }
        }
        if let Some(username) = lookup(ENV_USERNAME).filter(|u| !u.is_empty()) {
            self.last_username = Some(username);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

/// Lifecycle timings. Every field falls back to its default independently so
/// a partial `timings` object in the config file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    /// Upper bound on the `Unknown` state at startup.
    pub startup_timeout_ms: u64,
    /// How long the cross-tab sentinel key lives before it is removed.
    pub cross_tab_clear_delay_ms: u64,
    /// Delay between the expiry notification and the sign-in redirect.
    pub expiry_redirect_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Used when the server omits `expiresIn`.
    pub access_token_ttl_secs: i64,
    /// Used when the server omits `refreshExpiresIn`.
    pub refresh_token_ttl_secs: i64,
    pub max_rate_limit_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 5_000,
            cross_tab_clear_delay_ms: 100,
            expiry_redirect_delay_ms: 2_000,
            health_check_interval_secs: 30 * 60,
            request_timeout_secs: 30,
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 7 * 24 * 60 * 60,
            max_rate_limit_retries: 3,
            initial_backoff_ms: 1_000,
        }
    }
}

impl SessionTimings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn cross_tab_clear_delay(&self) -> Duration {
        Duration::from_millis(self.cross_tab_clear_delay_ms)
    }

    pub fn expiry_redirect_delay(&self) -> Duration {
        Duration::from_millis(self.expiry_redirect_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn access_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_token_ttl_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}
