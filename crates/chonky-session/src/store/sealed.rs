//! Passphrase sealing for the file-backed persistent store.
//!
//! Layout: `MAGIC | salt (16) | nonce (12) | ciphertext+tag`. The key is
//! derived with Argon2id from the passphrase and a salt, then kept for the
//! lifetime of the `Sealer`: later writes reuse that salt with a fresh
//! nonce, so a token renewal does not pay for another derivation. The magic
//! header is bound as AAD.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

const MAGIC: &[u8; 4] = b"CHS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

struct DerivedKey {
    salt: [u8; SALT_LEN],
    key: [u8; 32],
}

pub struct Sealer {
    passphrase: String,
    derived: Mutex<Option<DerivedKey>>,
}

impl Sealer {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            derived: Mutex::new(None),
        }
    }

    fn derived(&self) -> MutexGuard<'_, Option<DerivedKey>> {
        self.derived.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `bytes` carry the sealed-document header.
    pub fn is_sealed(bytes: &[u8]) -> bool {
        bytes.len() > HEADER_LEN && bytes.starts_with(MAGIC)
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
        Ok(key)
    }

    /// Key for `salt`, derived at most once per distinct salt.
    fn key_for(&self, salt: &[u8; SALT_LEN]) -> Result<[u8; 32]> {
        let mut derived = self.derived();
        if let Some(ref cached) = *derived {
            if cached.salt == *salt {
                return Ok(cached.key);
            }
        }
        let key = self.derive_key(salt)?;
        *derived = Some(DerivedKey { salt: *salt, key });
        Ok(key)
    }

    /// Salt and key to seal with: the cached pair, or a fresh salt.
    fn sealing_key(&self) -> Result<([u8; SALT_LEN], [u8; 32])> {
        if let Some(ref cached) = *self.derived() {
            return Ok((cached.salt, cached.key));
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Ok((salt, self.key_for(&salt)?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (salt, key) = self.sealing_key()?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key: Key = key.into();
        let nonce_ga: Nonce = nonce.into();
        let ciphertext = ChaCha20Poly1305::new(&key)
            .encrypt(
                &nonce_ga,
                Payload {
                    msg: plaintext,
                    aad: MAGIC,
                },
            )
            .map_err(|_| anyhow!("Failed to seal credential document"))?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_sealed(sealed) {
            bail!("Credential document is not sealed");
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&sealed[MAGIC.len()..MAGIC.len() + SALT_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[MAGIC.len() + SALT_LEN..HEADER_LEN]);

        let key: Key = self.key_for(&salt)?.into();
        let nonce_ga: Nonce = nonce.into();
        ChaCha20Poly1305::new(&key)
            .decrypt(
                &nonce_ga,
                Payload {
                    msg: &sealed[HEADER_LEN..],
                    aad: MAGIC,
                },
            )
            .map_err(|_| anyhow!("Failed to open credential document (wrong passphrase?)"))
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}
