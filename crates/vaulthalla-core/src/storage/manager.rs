//! Registry of per-vault engines and their change-event channels.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use dashmap::DashMap;
use tracing::info;

use crate::crypto::KeyRing;
use crate::db::{query, Store};
use crate::error::{Result, VaultError};
use crate::model::{FSEntry, Vault};
use crate::pool::ThreadPool;
use crate::storage::cache::CacheStore;
use crate::storage::engine::Engine;
use crate::storage::lock::PathLocks;
use crate::storage::paths::VaultPaths;
use crate::storage::thumbnail::{ThumbnailCodec, ThumbnailTask};
use crate::sync::events::ChangeEvent;

/// Owns the storage engines, one per registered vault.
pub struct StorageManager {
    store: Store,
    keys: Arc<KeyRing>,
    paths: Arc<VaultPaths>,
    locks: Arc<PathLocks>,
    cache: Arc<CacheStore>,
    codec: Arc<dyn ThumbnailCodec>,
    thumbnail_sizes: Vec<u32>,
    engines: DashMap<i64, Arc<Engine>>,
    /// Event receivers parked here until a sync loop claims them.
    unclaimed_events: DashMap<i64, Receiver<ChangeEvent>>,
}

impl StorageManager {
    pub fn new(
        store: Store,
        keys: Arc<KeyRing>,
        paths: Arc<VaultPaths>,
        locks: Arc<PathLocks>,
        cache: Arc<CacheStore>,
        codec: Arc<dyn ThumbnailCodec>,
        thumbnail_sizes: Vec<u32>,
    ) -> Self {
        Self {
            store,
            keys,
            paths,
            locks,
            cache,
            codec,
            thumbnail_sizes,
            engines: DashMap::new(),
            unclaimed_events: DashMap::new(),
        }
    }

    /// Build an engine for a vault; idempotent per vault id.
    pub fn register_vault(&self, vault: &Vault) -> Result<Arc<Engine>> {
        if let Some(existing) = self.engines.get(&vault.id) {
            return Ok(Arc::clone(&existing));
        }
        let (tx, rx) = unbounded();
        let engine = Arc::new(Engine::new(
            vault,
            self.store.clone(),
            Arc::clone(&self.keys),
            Arc::clone(&self.paths),
            Arc::clone(&self.locks),
            Arc::clone(&self.cache),
            tx,
        )?);
        self.engines.insert(vault.id, Arc::clone(&engine));
        self.unclaimed_events.insert(vault.id, rx);
        info!(vault = vault.id, name = %vault.name, "registered vault engine");
        Ok(engine)
    }

    pub fn engine(&self, vault_id: i64) -> Result<Arc<Engine>> {
        self.engines
            .get(&vault_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| VaultError::NotFound(format!("no engine for vault {vault_id}")))
    }

    pub fn engine_by_name(&self, name: &str) -> Result<Arc<Engine>> {
        let vault = self
            .store
            .with_conn(|conn| query::vault::get_vault_by_name(conn, name))?
            .ok_or_else(|| VaultError::NotFound(format!("vault {name}")))?;
        self.engine(vault.id)
    }

    /// Hand the change-event receiver of a vault to its sync loop.
    /// Each receiver can be claimed once.
    pub fn claim_events(&self, vault_id: i64) -> Option<Receiver<ChangeEvent>> {
        self.unclaimed_events.remove(&vault_id).map(|(_, rx)| rx)
    }

    pub fn vaults(&self) -> Result<Vec<Vault>> {
        self.store.with_conn(query::vault::list_vaults)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Dispatch thumbnail generation for a file onto the `thumb` pool.
    pub fn spawn_thumbnails(&self, pool: &ThreadPool, buffer: Vec<u8>, file: FSEntry) {
        let task = ThumbnailTask::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.codec),
            buffer,
            file,
            self.thumbnail_sizes.clone(),
        );
        pool.submit(move || task.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::db::query::vault::NewVault;
    use crate::model::VaultType;
    use crate::storage::thumbnail::PassthroughCodec;
    use tempfile::TempDir;

    fn manager() -> (StorageManager, Vault, TempDir) {
        let dir = TempDir::new().unwrap();
        let cfg = StorageConfig {
            mount_root: dir.path().join("mnt"),
            backing_root: dir.path().join("backing"),
            cache_root: dir.path().join("cache"),
            cache_limit_bytes: 1 << 20,
        };
        let store = Store::open_in_memory().unwrap();
        let vault_id = store
            .with_txn(|txn| {
                query::vault::add_vault(
                    txn,
                    &NewVault {
                        name: "docs",
                        owner_id: 1,
                        description: "",
                        quota_bytes: 0,
                        vault_type: VaultType::S3,
                        mount_path: "/mnt/vaulthalla/docs",
                    },
                )
            })
            .unwrap();
        let vault = store
            .with_conn(|c| query::vault::require_vault(c, vault_id))
            .unwrap();
        let paths = Arc::new(VaultPaths::new(&cfg));
        let cache = Arc::new(CacheStore::new(
            store.clone(),
            Arc::clone(&paths),
            1 << 20,
        ));
        let mgr = StorageManager::new(
            store,
            Arc::new(KeyRing::ephemeral()),
            paths,
            Arc::new(PathLocks::new()),
            cache,
            Arc::new(PassthroughCodec),
            vec![128],
        );
        (mgr, vault, dir)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (mgr, vault, _dir) = manager();
        let a = mgr.register_vault(&vault).unwrap();
        let b = mgr.register_vault(&vault).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_engine_lookup_by_name() {
        let (mgr, vault, _dir) = manager();
        mgr.register_vault(&vault).unwrap();
        assert!(mgr.engine_by_name("docs").is_ok());
        assert!(matches!(
            mgr.engine_by_name("nope").unwrap_err(),
            VaultError::NotFound(_)
        ));
    }

    #[test]
    fn test_events_claimed_once() {
        let (mgr, vault, _dir) = manager();
        let engine = mgr.register_vault(&vault).unwrap();
        let rx = mgr.claim_events(vault.id).unwrap();
        assert!(mgr.claim_events(vault.id).is_none());

        engine.create("/", "f", 0o644, 0, 0).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChangeEvent::Upload { .. }
        ));
    }
}
