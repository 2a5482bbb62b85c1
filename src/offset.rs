//! Durable offset checkpointing
//!
//! Tracks the replication-log position per connector+collection under a
//! stable record name. The store is write-behind: [`OffsetStore::stage`]
//! updates memory immediately and [`OffsetStore::flush`] persists dirty keys
//! one at a time. A crash between the two re-delivers already-sent events on
//! restart but never skips unsent ones, which is the accepted trade.
//!
//! Keys and values are opaque binary — the engine owns their meaning.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage backend for offset records.
///
/// `put` must be atomic per key; no multi-key transaction is required.
#[async_trait]
pub trait OffsetBackend: Send + Sync {
    /// Read every persisted key/value pair for the named record.
    async fn load_all(&self, name: &str) -> Result<HashMap<Bytes, Bytes>>;

    /// Persist one key atomically and independently of any other key.
    async fn put(&self, name: &str, key: &Bytes, value: &Bytes) -> Result<()>;

    /// Remove the named record entirely.
    async fn delete_all(&self, name: &str) -> Result<()>;
}

/// Shared offset backend.
pub type SharedOffsetBackend = Arc<dyn OffsetBackend>;

/// Per-collection offset store with write-behind flushing.
pub struct OffsetStore {
    backend: SharedOffsetBackend,
    name: String,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<Bytes, Bytes>,
    dirty: HashSet<Bytes>,
}

impl OffsetStore {
    /// Create a store for the given stable record name.
    pub fn new(backend: SharedOffsetBackend, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Stable record name this store reads and writes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load all persisted offsets into memory.
    ///
    /// An empty result means cold start — the engine will resync from the
    /// beginning of the log.
    pub async fn load(&self) -> Result<HashMap<Bytes, Bytes>> {
        let loaded = self.backend.load_all(&self.name).await?;

        let mut state = self.state.lock().await;
        state.cache = loaded.clone();
        state.dirty.clear();

        if loaded.is_empty() {
            info!("No offsets found for '{}', cold start", self.name);
        } else {
            info!("Loaded {} offset keys for '{}'", loaded.len(), self.name);
        }

        Ok(loaded)
    }

    /// Current in-memory value for a key.
    pub async fn get(&self, key: &Bytes) -> Option<Bytes> {
        let state = self.state.lock().await;
        state.cache.get(key).cloned()
    }

    /// Apply updates to memory only, marking the keys dirty.
    ///
    /// Memory may run ahead of durable state until the next [`flush`]; the
    /// lease holder is the only writer, so this is safe.
    ///
    /// [`flush`]: OffsetStore::flush
    pub async fn stage(&self, updates: impl IntoIterator<Item = (Bytes, Bytes)>) {
        let mut state = self.state.lock().await;
        for (key, value) in updates {
            state.dirty.insert(key.clone());
            state.cache.insert(key, value);
        }
    }

    /// Persist every dirty key, each one atomically and independently.
    ///
    /// A failed key stays dirty for the next attempt; keys already written
    /// remain durable.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending: Vec<Bytes> = state.dirty.iter().cloned().collect();

        for key in pending {
            let value = match state.cache.get(&key) {
                Some(v) => v.clone(),
                None => continue,
            };
            self.backend.put(&self.name, &key, &value).await?;
            state.dirty.remove(&key);
        }

        debug!("Flushed offsets for '{}'", self.name);
        Ok(())
    }

    /// Stage and flush in one call.
    pub async fn save(&self, updates: impl IntoIterator<Item = (Bytes, Bytes)>) -> Result<()> {
        self.stage(updates).await;
        self.flush().await
    }

    /// Drop all state, durable and in-memory, forcing a full resync on the
    /// next run.
    pub async fn reset(&self) -> Result<()> {
        self.backend.delete_all(&self.name).await?;

        let mut state = self.state.lock().await;
        state.cache.clear();
        state.dirty.clear();

        warn!("Reset offsets for '{}', next run performs a full resync", self.name);
        Ok(())
    }
}

/// Filesystem-backed offset storage.
///
/// One directory per record name, one file per key (URL-safe base64
/// filename), written atomically via temp file + rename.
pub struct FileOffsetBackend {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileOffsetBackend {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            fsync: true,
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    fn record_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(RelayError::offset(format!("invalid record name '{}'", name)));
        }
        Ok(self.base_dir.join(name))
    }

}

#[async_trait]
impl OffsetBackend for FileOffsetBackend {
    async fn load_all(&self, name: &str) -> Result<HashMap<Bytes, Bytes>> {
        let dir = self.record_dir(name)?;
        let mut offsets = HashMap::new();

        if !dir.exists() {
            return Ok(offsets);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "offset") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = match URL_SAFE_NO_PAD.decode(stem) {
                Ok(k) => Bytes::from(k),
                Err(e) => {
                    warn!("Skipping unreadable offset file {}: {}", path.display(), e);
                    continue;
                }
            };
            let value = fs::read(&path).await?;
            offsets.insert(key, Bytes::from(value));
        }

        Ok(offsets)
    }

    async fn put(&self, name: &str, key: &Bytes, value: &Bytes) -> Result<()> {
        let dir = self.record_dir(name)?;
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.offset", URL_SAFE_NO_PAD.encode(key)));

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(value).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_all(&self, name: &str) -> Result<()> {
        let dir = self.record_dir(name)?;
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// In-memory offset storage for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryOffsetBackend {
    records: Mutex<HashMap<String, HashMap<Bytes, Bytes>>>,
}

impl MemoryOffsetBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetBackend for MemoryOffsetBackend {
    async fn load_all(&self, name: &str) -> Result<HashMap<Bytes, Bytes>> {
        let records = self.records.lock().await;
        Ok(records.get(name).cloned().unwrap_or_default())
    }

    async fn put(&self, name: &str, key: &Bytes, value: &Bytes) -> Result<()> {
        let mut records = self.records.lock().await;
        records
            .entry(name.to_string())
            .or_default()
            .insert(key.clone(), value.clone());
        Ok(())
    }

    async fn delete_all(&self, name: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        records.remove(name);
        Ok(())
    }
}
