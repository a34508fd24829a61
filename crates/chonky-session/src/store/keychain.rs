use std::collections::HashMap;

use anyhow::{Context, Result};
use keyring::Entry;

use super::{KeyValueStore, KEYS};

/// Default keychain service name
pub const SERVICE_NAME: &str = "chonky-session";

/// Persistent namespace in the OS keychain, one entry per key.
///
/// Entries are created once and reused so every read and write for a key
/// goes through the same credential handle.
pub struct KeyringStore {
    entries: HashMap<&'static str, Entry>,
}

impl KeyringStore {
    pub fn new(service: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for key in KEYS {
            let entry = Entry::new(service, key).context("Failed to create keyring entry")?;
            entries.insert(key, entry);
        }
        Ok(Self { entries })
    }

    fn entry(&self, key: &str) -> Result<&Entry> {
        self.entries
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Unknown credential key: {}", key))
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }

    fn clear(&mut self) -> Result<()> {
        for key in KEYS {
            self.remove(key)?;
        }
        Ok(())
    }
}
