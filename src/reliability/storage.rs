use crate::diagnostics::Diagnostics;
use crate::sender::{ContentEncoding, Transmission};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use url::Url;

const RECORD_VERSION: u8 = 1;
const RECORD_EXTENSION: &str = "trn";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::error::EncodeError),
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] bincode::error::DecodeError),
    #[error("Unsupported record version: {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_path: PathBuf,
    pub capacity_bytes: u64,
    /// Stored transmissions older than this are discarded instead of resent.
    pub max_age: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: std::env::temp_dir().join("telemetry-channel").join("transmissions"),
            capacity_bytes: 50 * 1024 * 1024, // 50MB
            max_age: Some(Duration::from_secs(48 * 3600)),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTransmission {
    version: u8,
    id: String,
    endpoint: String,
    content_type: String,
    content_encoding: Option<ContentEncoding>,
    created_at_micros: i64,
    item_count: u64,
    attempt: u32,
    payload: Vec<u8>,
}

impl StoredTransmission {
    fn from_transmission(transmission: &Transmission) -> Self {
        Self {
            version: RECORD_VERSION,
            id: transmission.id.clone(),
            endpoint: transmission.endpoint.to_string(),
            content_type: transmission.content_type.clone(),
            content_encoding: transmission.content_encoding,
            created_at_micros: transmission.created_at.timestamp_micros(),
            item_count: transmission.item_count as u64,
            attempt: transmission.attempt,
            payload: transmission.payload.to_vec(),
        }
    }

    fn into_transmission(self) -> Result<Transmission, StorageError> {
        if self.version != RECORD_VERSION {
            return Err(StorageError::UnsupportedVersion(self.version));
        }
        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| StorageError::InvalidRecord(format!("endpoint '{}': {e}", self.endpoint)))?;
        let created_at = DateTime::<Utc>::from_timestamp_micros(self.created_at_micros)
            .ok_or_else(|| StorageError::InvalidRecord("creation time out of range".to_string()))?;

        Ok(Transmission {
            id: self.id,
            endpoint,
            payload: Bytes::from(self.payload),
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            created_at,
            item_count: self.item_count as usize,
            attempt: self.attempt,
        })
    }
}

/// Bounded, file-backed FIFO of transmissions that could not be delivered.
///
/// One file per transmission. File names start with the zero-padded creation
/// time, so the sorted in-memory index of stems (built from the directory at
/// startup) gives oldest-first order without listing the directory again.
/// A new write that would push the stored bytes past the capacity is refused;
/// nothing already stored is evicted to make room.
pub struct TransmissionStorage {
    storage_path: PathBuf,
    capacity: AtomicU64,
    max_age: Option<Duration>,
    used_bytes: AtomicU64,
    file_count: AtomicUsize,
    // Stems of the stored records. Holding the lock serializes every
    // directory mutation.
    index: Mutex<BTreeSet<String>>,
    diagnostics: Arc<Diagnostics>,
}

impl TransmissionStorage {
    pub async fn new(config: StorageConfig, diagnostics: Arc<Diagnostics>) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.storage_path).await?;

        let (used, index) = Self::scan_directory(&config.storage_path).await?;
        let count = index.len();
        if count > 0 {
            debug!(
                "Found {count} stored transmissions ({used} bytes) in {}",
                config.storage_path.display()
            );
        }

        Ok(Self {
            storage_path: config.storage_path,
            capacity: AtomicU64::new(config.capacity_bytes),
            max_age: config.max_age,
            used_bytes: AtomicU64::new(used),
            file_count: AtomicUsize::new(count),
            index: Mutex::new(index),
            diagnostics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Lowering the capacity below the current usage refuses new writes until
    /// enough stored transmissions have been dequeued.
    pub fn set_capacity(&self, capacity_bytes: u64) {
        self.capacity.store(capacity_bytes, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.file_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores the transmission produced by `factory`. The factory is only
    /// invoked when storage is not already full.
    pub async fn enqueue<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Option<Transmission>,
    {
        if self.used_bytes() >= self.capacity() {
            return false;
        }
        match factory() {
            Some(transmission) => self.store(transmission).await,
            None => false,
        }
    }

    /// Returns false when the write would exceed the capacity or failed.
    pub async fn store(&self, transmission: Transmission) -> bool {
        match self.try_store(&transmission).await {
            Ok(true) => {
                self.diagnostics.record_stored();
                true
            }
            Ok(false) => {
                debug!(
                    "Storage full ({} of {} bytes), refusing transmission {}",
                    self.used_bytes(),
                    self.capacity(),
                    transmission.id()
                );
                false
            }
            Err(e) => {
                error!("Failed to store transmission {}: {e}", transmission.id());
                false
            }
        }
    }

    async fn try_store(&self, transmission: &Transmission) -> Result<bool, StorageError> {
        let record = StoredTransmission::from_transmission(transmission);
        let data = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
        let size = data.len() as u64;

        let mut index = self.index.lock().await;

        let key = transmission.storage_key();
        let final_path = self.record_path(&key);
        // Re-storing a transmission replaces its earlier copy.
        let replaced = match fs::metadata(&final_path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };

        let used = self.used_bytes().saturating_sub(replaced.unwrap_or(0));
        if used.saturating_add(size) > self.capacity() {
            return Ok(false);
        }

        let temp_path = self.storage_path.join(format!("{key}.{TEMP_EXTENSION}"));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;

        self.used_bytes.store(used + size, Ordering::Relaxed);
        if index.insert(key) && replaced.is_none() {
            self.file_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            "Stored transmission {} ({} items, {} bytes)",
            transmission.id(),
            transmission.item_count(),
            size
        );
        Ok(true)
    }

    /// Removes and returns the oldest stored transmission.
    ///
    /// Unreadable records and records older than the maximum age are deleted
    /// and skipped.
    pub async fn dequeue(&self) -> Option<Transmission> {
        let mut index = self.index.lock().await;

        while let Some(key) = index.pop_first() {
            let path = self.record_path(&key);
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Stored transmission {key} vanished from disk");
                    self.forget(0);
                    continue;
                }
                Err(e) => {
                    // Left on disk; picked up again on the next restart.
                    error!("Failed to read stored transmission {key}: {e}");
                    continue;
                }
            };

            if let Err(e) = fs::remove_file(&path).await {
                error!("Failed to remove stored transmission {key}: {e}");
                continue;
            }
            self.forget(data.len() as u64);

            let transmission = match decode_record(&data) {
                Ok(transmission) => transmission,
                Err(e) => {
                    warn!("Deleted corrupt stored transmission {key}: {e}");
                    self.diagnostics.record_storage_corrupt();
                    continue;
                }
            };

            if self.is_expired(&transmission) {
                warn!(
                    "Discarded expired transmission {} created at {}",
                    transmission.id(),
                    transmission.created_at()
                );
                self.diagnostics
                    .record_storage_expired(transmission.item_count());
                continue;
            }

            return Some(transmission);
        }

        None
    }

    fn is_expired(&self, transmission: &Transmission) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        let age = Utc::now() - transmission.created_at();
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    fn forget(&self, size: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(size))
            });
        let _ = self
            .file_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_sub(1))
            });
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    /// Indexes the records in `path` and totals their size, removing temp
    /// files a crash left behind.
    async fn scan_directory(path: &Path) -> Result<(u64, BTreeSet<String>), StorageError> {
        let mut total_size = 0u64;
        let mut index = BTreeSet::new();
        let mut entries = fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(&format!(".{TEMP_EXTENSION}")) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove stale temp file {name}: {e}");
                }
            } else if let Some(key) = name.strip_suffix(&format!(".{RECORD_EXTENSION}")) {
                total_size += entry.metadata().await?.len();
                index.insert(key.to_string());
            }
        }

        Ok((total_size, index))
    }
}

fn decode_record(data: &[u8]) -> Result<Transmission, StorageError> {
    let (record, _): (StoredTransmission, usize) =
        bincode::serde::decode_from_slice(data, bincode::config::standard())?;
    record.into_transmission()
}

impl std::fmt::Debug for TransmissionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionStorage")
            .field("storage_path", &self.storage_path)
            .field("capacity", &self.capacity())
            .field("used_bytes", &self.used_bytes())
            .field("len", &self.len())
            .finish()
    }
}
