//! Authenticated encryption for stored secrets.
//!
//! AES-256-GCM with a key derived per secret:
//!
//! ```text
//! master_key (config) ─┬─► HKDF-SHA256 ─► record key
//!                      │
//! random salt ─────────┘
//! ```
//!
//! The stored blob is `salt || nonce || ciphertext || tag`. Salt and nonce
//! are fresh for every call, so encrypting the same plaintext twice never
//! yields the same bytes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use super::SecretError;

/// Minimum master key length, and size of the derived AES key.
const KEY_SIZE: usize = 32;

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// HKDF info string; bumping it invalidates every stored secret.
const KDF_INFO: &[u8] = b"runjs-gateway-secrets-v1";

/// Holds the master key and seals/opens secret values.
pub struct SecretsCrypto {
    master_key: SecretString,
}

impl SecretsCrypto {
    pub fn new(master_key: SecretString) -> Result<Self, SecretError> {
        if master_key.expose_secret().len() < KEY_SIZE {
            return Err(SecretError::InvalidMasterKey);
        }
        Ok(Self { master_key })
    }

    /// Encrypts `plaintext` into a self-contained blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, SecretError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let cipher = self.cipher(&salt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Opens a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Truncated or tampered blobs and blobs sealed under another master key
    /// all fail with `DecryptionFailed`; no partial plaintext is returned.
    pub fn decrypt(&self, blob: &[u8]) -> Result<SecretString, SecretError> {
        if blob.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SecretError::DecryptionFailed);
        }

        let (salt, rest) = blob.split_at(SALT_SIZE);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);

        let cipher = self.cipher(salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretError::DecryptionFailed)?;

        let text = String::from_utf8(plaintext).map_err(|_| SecretError::DecryptionFailed)?;
        Ok(SecretString::from(text))
    }

    fn cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, SecretError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.master_key.expose_secret().as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut key)
            .map_err(|_| SecretError::EncryptionFailed("HKDF expansion failed".to_string()))?;

        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::EncryptionFailed(format!("cipher init: {e}")))
    }
}

impl std::fmt::Debug for SecretsCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCrypto")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}
