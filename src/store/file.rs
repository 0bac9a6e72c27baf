//! File-backed store: a [`MemoryStore`] persisted as a snapshot on every commit.

use super::memory::{MemoryStore, MemoryTransaction};
use super::{Transaction, TransactionalStore};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"OBS\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Magic, version and length prefix.
const SNAPSHOT_HEADER_LEN: u64 = 4 + 1 + 8;

/// Trailing crc32.
const SNAPSHOT_CHECKSUM_LEN: u64 = 4;

/// Snapshot file name inside the store directory.
const SNAPSHOT_FILE: &str = "store.bin";

struct Persisted {
    memory: MemoryStore,
    dir: PathBuf,
    /// Serializes snapshot writes.
    write_lock: Mutex<()>,
}

impl Persisted {
    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Write the committed contents to disk (write temp file, then rename).
    fn persist(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        let entries = self.memory.snapshot();
        let encoded = rmp_serde::to_vec(&entries)?;

        let tmp_path = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&[SNAPSHOT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, self.snapshot_path())?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(());
        }
        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(CoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(CoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        let available = file
            .metadata()?
            .len()
            .saturating_sub(SNAPSHOT_HEADER_LEN + SNAPSHOT_CHECKSUM_LEN);
        if len > available {
            return Err(CoreError::Corruption(format!(
                "snapshot length {} exceeds file contents ({} bytes)",
                len, available
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&encoded) {
            return Err(CoreError::Corruption("snapshot checksum mismatch".into()));
        }

        let entries: Vec<(String, String, Vec<u8>)> = rmp_serde::from_slice(&encoded)?;
        self.memory.restore(entries);
        Ok(())
    }
}

/// Durable store for mailbox partitions and other state that should survive
/// a restart. Exclusive per directory.
pub struct FileStore {
    persisted: Arc<Persisted>,
    /// Lock file for exclusive access.
    _lock_file: File,
}

impl FileStore {
    /// Open (or create) a store in `dir`, loading its last snapshot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| CoreError::Locked)?;

        let persisted = Arc::new(Persisted {
            memory: MemoryStore::new(),
            dir,
            write_lock: Mutex::new(()),
        });
        persisted.load()?;

        Ok(Self {
            persisted,
            _lock_file: lock_file,
        })
    }

    /// Directory holding the snapshot and lock file.
    pub fn path(&self) -> &Path {
        &self.persisted.dir
    }

    /// The in-memory view, for fault injection and counters.
    pub fn memory(&self) -> &MemoryStore {
        &self.persisted.memory
    }
}

#[async_trait]
impl TransactionalStore for FileStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(FileTransaction {
            inner: self.persisted.memory.transaction(),
            persisted: Arc::clone(&self.persisted),
        }))
    }
}

struct FileTransaction {
    inner: MemoryTransaction,
    persisted: Arc<Persisted>,
}

#[async_trait]
impl Transaction for FileTransaction {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(collection, key).await
    }

    async fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.put(collection, key, value).await
    }

    async fn delete(&mut self, collection: &str, key: &str) -> Result<bool> {
        self.inner.delete(collection, key).await
    }

    async fn scan_prefix(
        &mut self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(collection, prefix).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let FileTransaction { inner, persisted } = *self;
        Box::new(inner).commit().await?;

        // Already visible in memory; a failed snapshot only costs durability.
        if let Err(e) = persisted.persist() {
            warn!(dir = %persisted.dir.display(), error = %e, "snapshot write failed");
        }
        Ok(())
    }
}
