//! Encrypted secret store.
//!
//! Callers hand in a plaintext value and get back an opaque id of the form
//! `runjs:secret:<32 hex>`. That id is the only thing that ever travels back
//! to the caller; the plaintext is sealed with [`crypto::SecretsCrypto`]
//! before it reaches a [`backend::SecretBackend`].

pub mod backend;
pub mod crypto;

use std::sync::Arc;

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};

use crate::config::{SecretsBackendKind, SecretsConfig};
use backend::{FileBackend, MemoryBackend, SecretBackend, SecretRecord};
use crypto::SecretsCrypto;

/// Namespace prefix of every secret id (and of placeholder tokens).
pub const ID_PREFIX: &str = "runjs:secret";

/// Attempts at finding a free id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret decryption failed")]
    DecryptionFailed,

    #[error("secret encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("master key must be at least 32 bytes")]
    InvalidMasterKey,

    #[error("secret value must not be empty")]
    EmptyValue,

    #[error("could not allocate a unique secret id")]
    IdExhausted,

    #[error("corrupt secret record: {0}")]
    CorruptRecord(String),

    #[error("secret storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("secret store lock poisoned")]
    LockPoisoned,
}

pub struct SecretStore {
    crypto: SecretsCrypto,
    backend: Arc<dyn SecretBackend>,
}

impl SecretStore {
    pub fn new(crypto: SecretsCrypto, backend: Arc<dyn SecretBackend>) -> Self {
        Self { crypto, backend }
    }

    /// Builds the store described by the `[secrets]` section.
    ///
    /// The memory backend may run without a configured master key: its
    /// records die with the process, so a random per-process key is used.
    /// The file backend always needs one.
    pub fn from_config(config: &SecretsConfig) -> Result<Self, SecretError> {
        let master_key = match (&config.master_key, config.backend) {
            (Some(key), _) => key.clone(),
            (None, SecretsBackendKind::Memory) => {
                warn!("No secrets master key configured, using an ephemeral key");
                ephemeral_master_key()
            }
            (None, SecretsBackendKind::File) => return Err(SecretError::InvalidMasterKey),
        };
        let crypto = SecretsCrypto::new(master_key)?;

        let backend: Arc<dyn SecretBackend> = match config.backend {
            SecretsBackendKind::Memory => Arc::new(MemoryBackend::new()),
            SecretsBackendKind::File => Arc::new(FileBackend::open(&config.path)?),
        };
        info!("Secret store: {:?} backend", config.backend);
        Ok(Self::new(crypto, backend))
    }

    /// Encrypts and persists `plaintext`, returning its new id.
    pub fn store(&self, plaintext: &SecretString, read_once: bool) -> Result<String, SecretError> {
        if plaintext.expose_secret().is_empty() {
            return Err(SecretError::EmptyValue);
        }

        let encrypted_value = self.crypto.encrypt(plaintext.expose_secret())?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id();
            let record = SecretRecord {
                id: id.clone(),
                encrypted_value: encrypted_value.clone(),
                read_once,
            };
            if self.backend.insert(record)? {
                info!("Stored secret {id} (read_once: {read_once})");
                return Ok(id);
            }
            warn!("Secret id collision on {id}, retrying");
        }
        Err(SecretError::IdExhausted)
    }

    /// Decrypts the secret behind `id`. A read-once secret is deleted by
    /// this call; every later call reports `NotFound`.
    pub fn retrieve(&self, id: &str) -> Result<SecretString, SecretError> {
        let id = id.to_ascii_lowercase();
        let record = self
            .backend
            .claim(&id)?
            .ok_or_else(|| SecretError::NotFound(id.clone()))?;

        match self.crypto.decrypt(&record.encrypted_value) {
            Ok(value) => {
                debug!("Retrieved secret {id} (read_once: {})", record.read_once);
                Ok(value)
            }
            Err(e) => {
                error!("Failed to decrypt secret {id}: {e}");
                Err(e)
            }
        }
    }
}

/// `runjs:secret:` followed by 128 random bits in lowercase hex.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{ID_PREFIX}:{}", hex::encode(bytes))
}

fn ephemeral_master_key() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretString::from(hex::encode(bytes))
}
