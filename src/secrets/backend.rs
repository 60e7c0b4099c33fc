//! Persistence for encrypted secret records.
//!
//! Backends only ever see ciphertext. The one operation that needs care is
//! [`SecretBackend::claim`]: for a read-once record the lookup and the
//! removal form one atomic step, so two racing readers can never both
//! receive the record.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SecretError;

/// One stored secret. `encrypted_value` is the sealed blob from
/// [`SecretsCrypto`](super::crypto::SecretsCrypto).
#[derive(Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub id: String,
    pub encrypted_value: Vec<u8>,
    pub read_once: bool,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("encrypted_value", &format_args!("<{} bytes>", self.encrypted_value.len()))
            .field("read_once", &self.read_once)
            .finish()
    }
}

pub trait SecretBackend: Send + Sync {
    /// Persists a new record. Returns `false` if the id is already taken.
    fn insert(&self, record: SecretRecord) -> Result<bool, SecretError>;

    /// Looks up a record. A read-once record is removed in the same step;
    /// any later or concurrent claim observes `None`.
    fn claim(&self, id: &str) -> Result<Option<SecretRecord>, SecretError>;
}

// ── In-memory ────────────────────────────────────────────

/// Process-local backend. Secrets are gone when the process exits.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemoryBackend {
    fn insert(&self, record: SecretRecord) -> Result<bool, SecretError> {
        let mut records = self.records.write().map_err(|_| SecretError::LockPoisoned)?;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record);
        Ok(true)
    }

    fn claim(&self, id: &str) -> Result<Option<SecretRecord>, SecretError> {
        {
            let records = self.records.read().map_err(|_| SecretError::LockPoisoned)?;
            match records.get(id) {
                None => return Ok(None),
                Some(record) if !record.read_once => return Ok(Some(record.clone())),
                Some(_) => {}
            }
        }

        // Read-once: whoever removes it under the write lock wins.
        let mut records = self.records.write().map_err(|_| SecretError::LockPoisoned)?;
        Ok(records.remove(id))
    }
}

// ── Directory of JSON records ────────────────────────────

/// On-disk layout of one record.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    encrypted_value: String,
    read_once: Option<bool>,
}

/// Durable backend: one `<id>.json` file per secret under a directory.
///
/// Read-once claims rename the file to a unique name before reading it.
/// `rename` is atomic, so only one claimant can move a given file.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: &Path) -> Result<Self, SecretError> {
        fs::create_dir_all(dir)?;
        debug!("Secret store directory: {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Maps an id to its file. Ids outside `[a-z0-9:]` never touch the disk.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == ':');
        valid.then(|| self.dir.join(format!("{}.json", id.replace(':', "_"))))
    }

    fn read_record(path: &Path) -> Result<Option<SecretRecord>, SecretError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredRecord = serde_json::from_str(&content)
            .map_err(|e| SecretError::CorruptRecord(e.to_string()))?;
        let encrypted_value = BASE64
            .decode(stored.encrypted_value.as_bytes())
            .map_err(|e| SecretError::CorruptRecord(e.to_string()))?;

        Ok(Some(SecretRecord {
            id: stored.id,
            encrypted_value,
            read_once: stored.read_once.unwrap_or(false),
        }))
    }
}

impl SecretBackend for FileBackend {
    fn insert(&self, record: SecretRecord) -> Result<bool, SecretError> {
        let path = self
            .record_path(&record.id)
            .ok_or_else(|| SecretError::CorruptRecord(format!("invalid id: {}", record.id)))?;

        let stored = StoredRecord {
            id: record.id.clone(),
            encrypted_value: BASE64.encode(&record.encrypted_value),
            read_once: record.read_once.then_some(true),
        };
        let json = serde_json::to_string(&stored)
            .map_err(|e| SecretError::CorruptRecord(e.to_string()))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(true)
    }

    fn claim(&self, id: &str) -> Result<Option<SecretRecord>, SecretError> {
        let Some(path) = self.record_path(id) else {
            return Ok(None);
        };

        let record = match Self::read_record(&path)? {
            Some(r) => r,
            None => return Ok(None),
        };
        if !record.read_once {
            return Ok(Some(record));
        }

        let claimed = path.with_extension(format!("claimed-{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            // Another reader claimed it first
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let result = Self::read_record(&claimed);
        if let Err(e) = fs::remove_file(&claimed) {
            warn!("Failed to remove claimed secret file {}: {e}", claimed.display());
        }
        result
    }
}
