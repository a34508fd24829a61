//! Principal-scoped application cache.
//!
//! Entries are JSON files named `<name>_<owner>.json` (`cart_42.json`).
//! The owner segment is the principal id with every byte outside
//! `[A-Za-z0-9]` written as `-XX` (uppercase hex), so distinct ids never
//! share a segment; `-guest` stands in for a signed-out visitor. The cache subscribes
//! to session events and purges a principal's entries when their session
//! ends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::PrincipalId;
use crate::session::SessionEvent;

/// Owner segment used when nobody is signed in. Never produced by
/// `owner` for a principal, since escapes are followed by hex digits.
const GUEST: &str = "-guest";

/// Consider an entry stale after 1 hour.
const CACHE_STALE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn is_stale(&self) -> bool {
        self.age_minutes() > CACHE_STALE_MINUTES
    }
}

pub struct PrincipalCache {
    cache_dir: PathBuf,
}

impl PrincipalCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    /// Filesystem-safe, reversible owner segment. Underscores are escaped
    /// too, since they separate the entry name from the owner.
    fn owner(principal: Option<&PrincipalId>) -> String {
        let Some(id) = principal else {
            return GUEST.to_string();
        };
        let mut out = String::with_capacity(id.0.len());
        for byte in id.0.bytes() {
            if byte.is_ascii_alphanumeric() {
                out.push(char::from(byte));
            } else {
                out.push_str(&format!("-{:02X}", byte));
            }
        }
        out
    }

    /// Entry key, e.g. `cart_42` or `cart_-guest`.
    pub fn entry_key(name: &str, principal: Option<&PrincipalId>) -> Result<String> {
        if name.is_empty() || name.contains('_') || name.contains(std::path::is_separator) {
            bail!("Invalid cache entry name: {:?}", name);
        }
        Ok(format!("{}_{}", name, Self::owner(principal)))
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    pub fn load<T: DeserializeOwned>(
        &self,
        name: &str,
        principal: Option<&PrincipalId>,
    ) -> Result<Option<CachedData<T>>> {
        let key = Self::entry_key(name, principal)?;
        let path = self.cache_path(&key);
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file: {}", key))?;
        let cached: CachedData<T> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file: {}", key))?;
        Ok(Some(cached))
    }

    pub fn save<T: Serialize>(
        &self,
        name: &str,
        principal: Option<&PrincipalId>,
        data: &T,
    ) -> Result<()> {
        let key = Self::entry_key(name, principal)?;
        let cached = CachedData::new(data);
        let contents = serde_json::to_string_pretty(&cached)?;
        std::fs::write(self.cache_path(&key), contents)
            .with_context(|| format!("Failed to write cache file: {}", key))?;
        Ok(())
    }

    pub fn remove(&self, name: &str, principal: Option<&PrincipalId>) -> Result<()> {
        let path = self.cache_path(&Self::entry_key(name, principal)?);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Delete every entry owned by `principal`. Returns how many were removed.
    pub fn purge(&self, principal: &PrincipalId) -> Result<usize> {
        let owner = Self::owner(Some(principal));
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.cache_dir).context("Failed to list cache directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let owned = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| stem.split_once('_'))
                .is_some_and(|(_, entry_owner)| entry_owner == owner);
            if owned {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        debug!(principal = %principal, removed = removed, "Purged principal cache entries");
        Ok(removed)
    }

    /// Purge a principal's entries whenever their session ends.
    pub fn spawn_purge_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::SignedOut { principal: id, reason }) => {
                        info!(principal = %id, reason = ?reason, "Session ended, purging cached entries");
                        if let Err(e) = self.purge(&id) {
                            warn!(principal = %id, error = %e, "Failed to purge principal cache");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Principal cache listener lagged behind session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
