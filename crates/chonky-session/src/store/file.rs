use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::sealed::Sealer;
use super::KeyValueStore;

/// Credential file name in the storage directory
const CREDENTIALS_FILE: &str = "credentials.json";

type Document = BTreeMap<String, String>;

/// Persistent namespace backed by a single JSON document on disk,
/// optionally sealed with a passphrase. The decoded document is kept in
/// memory after the first read, so the key is not re-derived per lookup.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    sealer: Option<Sealer>,
    doc: RefCell<Option<Document>>,
}

impl FileStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
            sealer: None,
            doc: RefCell::new(None),
        }
    }

    pub fn sealed(dir: &Path, sealer: Sealer) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
            sealer: Some(sealer),
            doc: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document> {
        if let Some(ref doc) = *self.doc.borrow() {
            return Ok(doc.clone());
        }
        let doc = self.read_file()?;
        *self.doc.borrow_mut() = Some(doc.clone());
        Ok(doc)
    }

    fn read_file(&self) -> Result<Document> {
        if !self.path.exists() {
            return Ok(Document::new());
        }
        let bytes = std::fs::read(&self.path).context("Failed to read credential file")?;

        let plain = match (&self.sealer, Sealer::is_sealed(&bytes)) {
            (Some(sealer), true) => sealer.open(&bytes)?,
            (None, true) => {
                anyhow::bail!("Credential file is sealed but no passphrase is configured")
            }
            // Plain documents written before a passphrase was set are still readable
            (_, false) => bytes,
        };

        serde_json::from_slice(&plain).context("Failed to parse credential file")
    }

    fn save(&self, doc: Document) -> Result<()> {
        if doc.is_empty() {
            return self.remove_file();
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(&doc)?;
        let bytes = match self.sealer {
            Some(ref sealer) => sealer.seal(&contents)?,
            None => contents,
        };
        std::fs::write(&self.path, bytes).context("Failed to write credential file")?;
        restrict_permissions(&self.path)?;
        debug!(path = %self.path.display(), sealed = self.sealer.is_some(), "Credential file written");
        *self.doc.borrow_mut() = Some(doc);
        Ok(())
    }

    fn remove_file(&self) -> Result<()> {
        // Forget the cached copy first so a failed removal is re-read from disk
        *self.doc.borrow_mut() = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove credential file")?;
        }
        *self.doc.borrow_mut() = Some(Document::new());
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credential file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut doc = self.load()?;
        doc.insert(key.to_string(), value.to_string());
        self.save(doc)
    }

    fn set_all(&mut self, entries: &[(&str, String)]) -> Result<()> {
        let mut doc = self.load()?;
        for (key, value) in entries {
            doc.insert(key.to_string(), value.clone());
        }
        self.save(doc)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut doc = self.load()?;
        if doc.remove(key).is_some() {
            self.save(doc)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.remove_file()
    }
}
