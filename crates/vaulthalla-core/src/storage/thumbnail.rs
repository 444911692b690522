//! Thumbnail generation tasks.
//!
//! Rendering is delegated to a [`ThumbnailCodec`] collaborator; this
//! module owns the task shape dispatched onto the `thumb` pool: explicit
//! inputs, atomic cache writes, a `cache_index` upsert per size, and
//! errors that are logged but never surfaced.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::model::FSEntry;
use crate::storage::cache::CacheStore;

/// Renders one thumbnail size from a decoded source buffer.
pub trait ThumbnailCodec: Send + Sync {
    /// Produce JPEG bytes for a square thumbnail of `size` pixels.
    fn render(&self, buffer: &[u8], mime: &str, size: u32) -> Result<Vec<u8>>;
}

/// Codec stub that hands the source buffer back unchanged. Stands in for
/// the real image/PDF pipeline in tests and local setups without it.
pub struct PassthroughCodec;

impl ThumbnailCodec for PassthroughCodec {
    fn render(&self, buffer: &[u8], _mime: &str, _size: u32) -> Result<Vec<u8>> {
        Ok(buffer.to_vec())
    }
}

/// One thumbnail generation unit: all inputs explicit, no global lookups.
pub struct ThumbnailTask {
    cache: Arc<CacheStore>,
    codec: Arc<dyn ThumbnailCodec>,
    buffer: Vec<u8>,
    file: FSEntry,
    sizes: Vec<u32>,
}

impl ThumbnailTask {
    pub fn new(
        cache: Arc<CacheStore>,
        codec: Arc<dyn ThumbnailCodec>,
        buffer: Vec<u8>,
        file: FSEntry,
        sizes: Vec<u32>,
    ) -> Self {
        Self {
            cache,
            codec,
            buffer,
            file,
            sizes,
        }
    }

    /// Run to completion. Failures are logged per size; the task itself
    /// never reports an error to its submitter.
    pub fn run(self) {
        let Some(mime) = self.file.mime_type.clone() else {
            warn!(file_id = self.file.id, "no MIME type, skipping thumbnails");
            return;
        };
        for size in &self.sizes {
            match self.codec.render(&self.buffer, &mime, *size) {
                Ok(jpeg) => match self.cache.store_thumbnail(&self.file, *size, &jpeg) {
                    Ok(path) => {
                        debug!(file_id = self.file.id, size, path = %path.display(), "thumbnail stored");
                    }
                    Err(e) => {
                        error!(file_id = self.file.id, size, error = %e, "thumbnail cache write failed");
                    }
                },
                Err(e) => {
                    error!(file_id = self.file.id, size, error = %e, "thumbnail render failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::db::Store;
    use crate::error::VaultError;
    use crate::model::EntryKind;
    use crate::storage::paths::VaultPaths;
    use tempfile::TempDir;

    fn file_entry(mime: Option<&str>) -> FSEntry {
        FSEntry {
            id: 1,
            inode: 11,
            parent_id: Some(1),
            vault_id: 1,
            name: "pic.jpg".into(),
            base32_alias: "thumbalias".into(),
            path: "/pic.jpg".into(),
            kind: EntryKind::File,
            mode: 0o644,
            owner_uid: 0,
            group_gid: 0,
            is_hidden: false,
            is_system: false,
            size_bytes: 4,
            mime_type: mime.map(String::from),
            content_hash: None,
            encryption_iv: None,
            key_version: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn cache() -> (Arc<CacheStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cfg = StorageConfig {
            mount_root: dir.path().join("mnt"),
            backing_root: dir.path().join("backing"),
            cache_root: dir.path().join("cache"),
            cache_limit_bytes: 1 << 20,
        };
        let store = Store::open_in_memory().unwrap();
        let paths = Arc::new(VaultPaths::new(&cfg));
        (Arc::new(CacheStore::new(store, paths, 1 << 20)), dir)
    }

    #[test]
    fn test_generates_each_configured_size() {
        let (cache, dir) = cache();
        let task = ThumbnailTask::new(
            cache,
            Arc::new(PassthroughCodec),
            b"jpeg".to_vec(),
            file_entry(Some("image/jpeg")),
            vec![128, 512],
        );
        task.run();

        assert!(dir.path().join("cache/thumbnails/thumbalias/128.jpg").exists());
        assert!(dir.path().join("cache/thumbnails/thumbalias/512.jpg").exists());
    }

    #[test]
    fn test_missing_mime_skips_quietly() {
        let (cache, dir) = cache();
        let task = ThumbnailTask::new(
            cache,
            Arc::new(PassthroughCodec),
            b"jpeg".to_vec(),
            file_entry(None),
            vec![128],
        );
        task.run();
        assert!(!dir.path().join("cache/thumbnails/thumbalias/128.jpg").exists());
    }

    #[test]
    fn test_codec_failure_is_swallowed() {
        struct FailingCodec;
        impl ThumbnailCodec for FailingCodec {
            fn render(&self, _: &[u8], _: &str, _: u32) -> Result<Vec<u8>> {
                Err(VaultError::Io("decoder exploded".into()))
            }
        }

        let (cache, _dir) = cache();
        let task = ThumbnailTask::new(
            cache,
            Arc::new(FailingCodec),
            b"jpeg".to_vec(),
            file_entry(Some("image/jpeg")),
            vec![128],
        );
        // Must not panic or propagate.
        task.run();
    }
}
