//! Concurrency behavior: parallel engine mutations stay consistent and
//! the pool population is conserved under churn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use vaulthalla_core::config::{PoolConfig, StorageConfig};
use vaulthalla_core::crypto::KeyRing;
use vaulthalla_core::db::{query, Store};
use vaulthalla_core::model::VaultType;
use vaulthalla_core::pool::PoolManager;
use vaulthalla_core::storage::{CacheStore, Engine, PathLocks, VaultPaths};

fn engine_fixture() -> (Arc<Engine>, Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let cfg = StorageConfig {
        mount_root: dir.path().join("mnt"),
        backing_root: dir.path().join("backing"),
        cache_root: dir.path().join("cache"),
        cache_limit_bytes: 1 << 20,
    };
    let store = Store::open(&dir.path().join("meta.db"), 4).unwrap();
    let vault_id = store
        .with_txn(|txn| {
            query::vault::add_vault(
                txn,
                &query::vault::NewVault {
                    name: "par",
                    owner_id: 1,
                    description: "",
                    quota_bytes: 0,
                    vault_type: VaultType::Local,
                    mount_path: "/mnt/vaulthalla/par",
                },
            )
        })
        .unwrap();
    let vault = store
        .with_conn(|c| query::vault::require_vault(c, vault_id))
        .unwrap();

    let paths = Arc::new(VaultPaths::new(&cfg));
    let cache = Arc::new(CacheStore::new(store.clone(), Arc::clone(&paths), 1 << 20));
    let (tx, _rx) = crossbeam_channel::unbounded();
    let engine = Arc::new(
        Engine::new(
            &vault,
            store.clone(),
            Arc::new(KeyRing::ephemeral()),
            paths,
            Arc::new(PathLocks::new()),
            cache,
            tx,
        )
        .unwrap(),
    );
    (engine, store, dir)
}

#[test]
fn test_parallel_writers_distinct_files() {
    let (engine, store, _dir) = engine_fixture();
    engine.mkdir("/", "shared", 0o755, 0, 0).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            let name = format!("f{i}");
            engine.create("/shared", &name, 0o644, 0, 0).unwrap();
            let payload = vec![i as u8; 100];
            engine
                .write_full(&format!("/shared/{name}"), &payload)
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let dir = engine.entry("/shared").unwrap();
    let stats = store
        .with_conn(|c| query::entry::dir_stats(c, dir.id))
        .unwrap();
    assert_eq!(stats.file_count, 8);
    assert_eq!(stats.size_bytes, 800);

    for i in 0..8 {
        let data = engine.read(&format!("/shared/f{i}"), 0, 200).unwrap();
        assert_eq!(data, vec![i as u8; 100]);
    }
}

#[test]
fn test_parallel_writers_same_file_last_write_wins_whole() {
    let (engine, _store, _dir) = engine_fixture();
    engine.create("/", "contended", 0o644, 0, 0).unwrap();

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            engine.write_full("/contended", &vec![i; 50]).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Path locking guarantees one whole writer at a time: the final
    // content is exactly one writer's payload, never interleaved.
    let data = engine.read("/contended", 0, 100).unwrap();
    assert_eq!(data.len(), 50);
    assert!(data.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_pool_conservation_under_churn() {
    let manager = PoolManager::init(&PoolConfig::default());
    let fuse = manager.fuse_pool();
    let sync = manager.sync_pool();

    for i in 0..200 {
        let pool = if i % 2 == 0 { &fuse } else { &sync };
        pool.submit(move || {
            std::thread::sleep(Duration::from_micros(200));
        });
    }

    // Workers migrate while the backlog drains; the population is
    // conserved at every observation point.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let totals = manager.totals();
        assert!(totals.conserved(), "lost or duplicated a worker: {totals:?}");
        if (fuse.pending() == 0 && sync.pending() == 0) || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    manager.shutdown();
    let totals = manager.totals();
    assert_eq!(
        totals.pools.iter().map(|(_, n)| n).sum::<usize>() + totals.reserve,
        0,
        "shutdown joins every worker"
    );
}
