//! # Payload Encryption at Rest
//!
//! Sensitive columns (queued payloads, cached payloads, tokens) pass through
//! [`PayloadCipher`] on their way in and out of SQLite.
//!
//! ## Stored Format
//! ```text
//!   enc1:<base64( nonce[12] || AES-256-GCM ciphertext+tag )>
//!
//!   key = SHA-256(passphrase)
//! ```
//!
//! Values without the `enc1:` prefix are plaintext rows written before
//! encryption was turned on and are returned unchanged.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{DbError, DbResult};

/// Prefix marking an encrypted column value.
pub const ENCRYPTED_PREFIX: &str = "enc1:";

const NONCE_LEN: usize = 12;

/// Seals and opens sensitive column values.
#[derive(Clone, Default)]
pub struct PayloadCipher {
    cipher: Option<Arc<Aes256Gcm>>,
}

impl PayloadCipher {
    /// Cipher that stores plaintext.
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    /// Derives a 256-bit key from the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: Some(Arc::new(Aes256Gcm::new(&key))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypts a value for storage. Identity when disabled.
    pub fn seal(&self, plaintext: &str) -> DbResult<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| DbError::Encryption("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(sealed)))
    }

    /// Decrypts a stored value.
    pub fn open(&self, stored: &str) -> DbResult<String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            DbError::Encryption("value is encrypted but no key is configured".to_string())
        })?;

        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| DbError::Encryption(format!("malformed ciphertext: {e}")))?;

        if sealed.len() <= NONCE_LEN {
            return Err(DbError::Encryption("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DbError::Encryption("wrong key or tampered ciphertext".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| DbError::Encryption(format!("decrypted value is not UTF-8: {e}")))
    }

    /// Seals an optional value.
    pub fn seal_opt(&self, plaintext: Option<&str>) -> DbResult<Option<String>> {
        plaintext.map(|p| self.seal(p)).transpose()
    }

    /// Opens an optional value.
    pub fn open_opt(&self, stored: Option<&str>) -> DbResult<Option<String>> {
        stored.map(|s| self.open(s)).transpose()
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
