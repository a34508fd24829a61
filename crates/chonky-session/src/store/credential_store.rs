use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::auth::{CredentialPair, PersistenceMode};
use crate::config::{PersistentBackend, SessionConfig};

use super::keychain::SERVICE_NAME;
use super::{
    FileStore, KeyValueStore, KeyringStore, MemoryStore, Sealer, KEY_ACCESS, KEY_ISSUED_AT,
    KEY_MODE, KEY_REFRESH,
};

/// Holds the active credential pair in exactly one of two namespaces.
///
/// Invariant: at most one namespace holds a pair; writing in one mode
/// clears the other first.
pub struct CredentialStore {
    ephemeral: Box<dyn KeyValueStore>,
    persistent: Box<dyn KeyValueStore>,
    active: Option<PersistenceMode>,
}

impl CredentialStore {
    /// Wrap two namespaces and work out which one (if any) is active.
    pub fn open(
        ephemeral: Box<dyn KeyValueStore>,
        persistent: Box<dyn KeyValueStore>,
    ) -> Result<Self> {
        let mut store = Self {
            ephemeral,
            persistent,
            active: None,
        };
        store.active = store.detect_active()?;
        debug!(active = ?store.active, "Credential store opened");
        Ok(store)
    }

    /// Fresh in-memory ephemeral namespace plus the configured persistent one.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let persistent: Box<dyn KeyValueStore> = match config.persistent_backend {
            PersistentBackend::File => {
                let dir = config.storage_dir()?;
                match config.passphrase {
                    Some(ref passphrase) => Box::new(FileStore::sealed(&dir, Sealer::new(passphrase.as_str()))),
                    None => Box::new(FileStore::new(&dir)),
                }
            }
            PersistentBackend::Keyring => Box::new(KeyringStore::new(SERVICE_NAME)?),
        };
        Self::open(Box::new(MemoryStore::new()), persistent)
    }

    /// Persistent wins over ephemeral, as a remembered login outlives a tab.
    fn detect_active(&mut self) -> Result<Option<PersistenceMode>> {
        for mode in [PersistenceMode::Persistent, PersistenceMode::Ephemeral] {
            if read_pair(self.backend(mode))?.is_some() {
                let marker = self.backend(mode).get(KEY_MODE)?;
                if marker.as_deref().and_then(PersistenceMode::parse) != Some(mode) {
                    warn!(namespace = mode.as_str(), marker = ?marker, "Stored mode marker does not match its namespace");
                }
                let other = mode.other();
                if read_pair(self.backend(other))?.is_some() {
                    warn!(keep = mode.as_str(), "Both credential stores populated, clearing the other");
                    self.backend_mut(other).clear()?;
                }
                return Ok(Some(mode));
            }
        }
        Ok(None)
    }

    fn backend(&self, mode: PersistenceMode) -> &dyn KeyValueStore {
        match mode {
            PersistenceMode::Ephemeral => self.ephemeral.as_ref(),
            PersistenceMode::Persistent => self.persistent.as_ref(),
        }
    }

    fn backend_mut(&mut self, mode: PersistenceMode) -> &mut dyn KeyValueStore {
        match mode {
            PersistenceMode::Ephemeral => self.ephemeral.as_mut(),
            PersistenceMode::Persistent => self.persistent.as_mut(),
        }
    }

    /// Clear the namespace not matching `mode`, then write `pair` to the one that does.
    pub fn write(&mut self, pair: &CredentialPair, mode: PersistenceMode) -> Result<()> {
        let other = mode.other();
        self.backend_mut(other)
            .clear()
            .with_context(|| format!("Failed to clear {} credential store", other.as_str()))?;

        let entries = [
            (KEY_ACCESS, pair.access_token.clone()),
            (KEY_REFRESH, pair.refresh_token.clone()),
            (KEY_ISSUED_AT, pair.issued_at.to_rfc3339()),
            (KEY_MODE, mode.as_str().to_string()),
        ];
        if let Err(e) = self.backend_mut(mode).set_all(&entries) {
            // Never leave a half-written pair behind
            if let Err(cleanup) = self.backend_mut(mode).clear() {
                warn!(mode = mode.as_str(), error = %cleanup, "Failed to clear half-written credentials");
            }
            self.active = None;
            return Err(e.context(format!("Failed to write {} credential store", mode.as_str())));
        }

        self.active = Some(mode);
        debug!(mode = mode.as_str(), "Credentials written");
        Ok(())
    }

    /// The pair from the active namespace, if any.
    pub fn read(&self) -> Result<Option<CredentialPair>> {
        match self.active {
            Some(mode) => read_pair(self.backend(mode)),
            None => Ok(None),
        }
    }

    /// Empty both namespaces and forget the active mode.
    pub fn clear(&mut self) -> Result<()> {
        self.active = None;
        let ephemeral = self.ephemeral.clear().context("Failed to clear ephemeral credential store");
        let persistent = self.persistent.clear().context("Failed to clear persistent credential store");
        debug!("Credentials cleared");
        ephemeral.and(persistent)
    }

    pub fn active_mode(&self) -> Option<PersistenceMode> {
        self.active
    }
}

/// Read a complete pair from one namespace. A half-written pair counts as absent.
fn read_pair(store: &dyn KeyValueStore) -> Result<Option<CredentialPair>> {
    let (Some(access_token), Some(refresh_token)) = (store.get(KEY_ACCESS)?, store.get(KEY_REFRESH)?)
    else {
        return Ok(None);
    };
    // Unknown age is treated as freshly issued; a stale token is caught by
    // the first rejected call instead.
    let issued_at = store
        .get(KEY_ISSUED_AT)?
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Some(CredentialPair {
        access_token,
        refresh_token,
        issued_at,
    }))
}
