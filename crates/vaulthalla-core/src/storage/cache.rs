//! Materialized plaintext cache and its size-bounded LRU eviction.
//!
//! Decrypted file blobs and rendered thumbnails live under the cache
//! root, indexed in `cache_index`. Eviction walks `last_accessed`
//! ascending and removes the blob and the row together.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{query, Store};
use crate::error::{Result, VaultError};
use crate::model::{CacheKind, FSEntry};
use crate::storage::paths::VaultPaths;

/// Store-backed cache bookkeeping shared by every engine.
pub struct CacheStore {
    store: Store,
    paths: Arc<VaultPaths>,
    limit_bytes: u64,
}

impl CacheStore {
    pub fn new(store: Store, paths: Arc<VaultPaths>, limit_bytes: u64) -> Self {
        Self {
            store,
            paths,
            limit_bytes,
        }
    }

    fn file_rel(entry: &FSEntry) -> String {
        format!("files/{}", entry.base32_alias)
    }

    /// Serve a file's plaintext from the cache, refreshing its LRU clock.
    /// A dangling index row (blob vanished underneath) is dropped and
    /// treated as a miss.
    pub fn read_file(&self, entry: &FSEntry) -> Result<Option<Vec<u8>>> {
        let rel = Self::file_rel(entry);
        let record = self
            .store
            .with_conn(|conn| query::cache::get_by_path(conn, entry.vault_id, &rel))?;
        let Some(record) = record else {
            return Ok(None);
        };

        let abs = self.paths.cache_root.join(&record.path);
        match fs::read(&abs) {
            Ok(data) => {
                self.store.with_txn(|txn| query::cache::touch(txn, record.id))?;
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.store.with_txn(|txn| query::cache::delete(txn, record.id))?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a decrypted blob into the cache and index it.
    pub fn materialize_file(&self, entry: &FSEntry, plaintext: &[u8]) -> Result<PathBuf> {
        let abs = self.paths.cache_file_path(&entry.base32_alias);
        self.write_atomic(&abs, plaintext)?;

        let rel = Self::file_rel(entry);
        self.store.with_txn(|txn| {
            query::cache::upsert(
                txn,
                entry.vault_id,
                entry.id,
                &rel,
                CacheKind::File,
                plaintext.len() as u64,
            )
        })?;
        self.evict_to_limit()?;
        Ok(abs)
    }

    /// Write a rendered thumbnail and index it.
    pub fn store_thumbnail(&self, entry: &FSEntry, size: u32, jpeg: &[u8]) -> Result<PathBuf> {
        let abs = self.paths.thumbnail_path(&entry.base32_alias, size);
        self.write_atomic(&abs, jpeg)?;

        let rel = self.paths.cache_rel(&abs)?;
        self.store.with_txn(|txn| {
            query::cache::upsert(
                txn,
                entry.vault_id,
                entry.id,
                &rel.to_string_lossy(),
                CacheKind::Thumbnail,
                jpeg.len() as u64,
            )
        })?;
        Ok(abs)
    }

    /// Remove the cached plaintext and thumbnails of an entry from disk.
    /// Index rows are the caller's transaction; this is the blob side.
    pub fn drop_blobs_for(&self, entry: &FSEntry) -> Result<()> {
        let file = self.paths.cache_file_path(&entry.base32_alias);
        if let Err(e) = fs::remove_file(&file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        let thumbs = self.paths.cache_root.join("thumbnails").join(&entry.base32_alias);
        if let Err(e) = fs::remove_dir_all(&thumbs) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Bytes currently indexed.
    pub fn usage(&self) -> Result<u64> {
        self.store.with_conn(query::cache::total_size)
    }

    /// Evict least-recently-used records until usage fits the limit.
    /// Blob and row go together, one record per transaction.
    pub fn evict_to_limit(&self) -> Result<u64> {
        let mut freed = 0u64;
        let mut usage = self.usage()?;
        while usage > self.limit_bytes {
            let victims = self
                .store
                .with_conn(|conn| query::cache::lru_candidates(conn, 16))?;
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                if usage <= self.limit_bytes {
                    break;
                }
                self.store.with_txn(|txn| query::cache::delete(txn, victim.id))?;
                let abs = self.paths.cache_root.join(&victim.path);
                if let Err(e) = fs::remove_file(&abs) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %abs.display(), error = %e, "evicted blob removal failed");
                    }
                }
                usage = usage.saturating_sub(victim.size);
                freed += victim.size;
                debug!(path = %victim.path.display(), size = victim.size, "evicted cache record");
            }
        }
        Ok(freed)
    }

    fn write_atomic(&self, abs: &PathBuf, data: &[u8]) -> Result<()> {
        let parent = abs
            .parent()
            .ok_or_else(|| VaultError::Io(format!("{} has no parent", abs.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.persist(abs)
            .map_err(|e| VaultError::Io(format!("atomic cache write failed: {e}")))?;
        Ok(())
    }
}
