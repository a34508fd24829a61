//! Credential persistence.
//!
//! This module provides:
//! - `KeyValueStore`: the namespace abstraction both backing stores implement
//! - `MemoryStore`: the ephemeral namespace (process lifetime)
//! - `FileStore`: a persistent JSON document, optionally sealed
//! - `KeyringStore`: a persistent namespace in the OS keychain
//! - `CredentialStore`: keeps exactly one namespace holding the active pair

pub mod credential_store;
pub mod file;
pub mod keychain;
pub mod memory;
pub mod sealed;

use anyhow::Result;

pub use credential_store::CredentialStore;
pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;
pub use sealed::Sealer;

pub const KEY_ACCESS: &str = "access";
pub const KEY_REFRESH: &str = "refresh";
pub const KEY_ISSUED_AT: &str = "issued_at";
pub const KEY_MODE: &str = "mode";

/// Every key a namespace may hold.
pub const KEYS: [&str; 4] = [KEY_ACCESS, KEY_REFRESH, KEY_ISSUED_AT, KEY_MODE];

/// A string key/value namespace.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Write several keys. Backends that can batch should override this.
    fn set_all(&mut self, entries: &[(&str, String)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()>;

    /// Remove everything. Clearing an empty namespace is not an error.
    fn clear(&mut self) -> Result<()>;
}
