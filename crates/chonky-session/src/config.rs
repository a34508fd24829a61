//! Session configuration management.
//!
//! Configuration is read from `~/.config/chonky-session/config.json` when it
//! exists and then overlaid with `CHONKY_*` environment variables (a `.env`
//! file in the working directory is honored).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Application name used for config/storage directory paths
pub const APP_NAME: &str = "chonky-session";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API base URL (local development backend)
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Access token lifetime assumed by the renewal timer.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 30 * 60;

/// Renew this long before the access token lifetime elapses.
const DEFAULT_REFRESH_LEAD_SECS: u64 = 5 * 60;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Which backend holds the persistent ("remember me") namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentBackend {
    /// JSON document under the platform data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub token_lifetime_secs: u64,
    pub refresh_lead_secs: u64,
    pub request_timeout_secs: u64,
    pub persistent_backend: PersistentBackend,
    /// Overrides the platform data directory for the file backend
    pub storage_dir: Option<PathBuf>,
    /// Seals the file backend when set. Never written back to disk.
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
            refresh_lead_secs: DEFAULT_REFRESH_LEAD_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            persistent_backend: PersistentBackend::File,
            storage_dir: None,
            passphrase: None,
        }
    }
}

impl SessionConfig {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        // Silently ignore a missing .env file
        let _ = dotenvy::dotenv();

        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
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

    /// Overlay `CHONKY_*` variables. Unparseable numbers are ignored with a warning.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number(key: &str, value: Option<String>, target: &mut u64) {
            if let Some(raw) = value {
                match raw.trim().parse() {
                    Ok(n) => *target = n,
                    Err(_) => warn!(key = key, value = %raw, "Ignoring non-numeric setting"),
                }
            }
        }

        if let Some(url) = lookup("CHONKY_API_BASE_URL") {
            self.api_base_url = url;
        }
        number(
            "CHONKY_TOKEN_LIFETIME_SECS",
            lookup("CHONKY_TOKEN_LIFETIME_SECS"),
            &mut self.token_lifetime_secs,
        );
        number(
            "CHONKY_REFRESH_LEAD_SECS",
            lookup("CHONKY_REFRESH_LEAD_SECS"),
            &mut self.refresh_lead_secs,
        );
        number(
            "CHONKY_REQUEST_TIMEOUT_SECS",
            lookup("CHONKY_REQUEST_TIMEOUT_SECS"),
            &mut self.request_timeout_secs,
        );
        if let Some(backend) = lookup("CHONKY_PERSISTENT_BACKEND") {
            match backend.trim().to_lowercase().as_str() {
                "file" => self.persistent_backend = PersistentBackend::File,
                "keyring" => self.persistent_backend = PersistentBackend::Keyring,
                other => warn!(value = other, "Unknown persistent backend, keeping {:?}", self.persistent_backend),
            }
        }
        if let Some(passphrase) = lookup("CHONKY_SESSION_PASSPHRASE") {
            if !passphrase.is_empty() {
                self.passphrase = Some(passphrase);
            }
        }
    }

    /// Delay between renewals: a lead time short of the token lifetime.
    /// Never shorter than one second.
    pub fn refresh_interval(&self) -> Duration {
        let secs = self
            .token_lifetime_secs
            .saturating_sub(self.refresh_lead_secs)
            .max(1);
        Duration::from_secs(secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the file-backed persistent store and principal caches.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find local data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
