//! End-to-end scenarios across the store, engine, and resolver.

use std::sync::Arc;

use tempfile::TempDir;

use vaulthalla_core::config::StorageConfig;
use vaulthalla_core::crypto::KeyRing;
use vaulthalla_core::db::{query, Store};
use vaulthalla_core::model::{
    OverrideEffect, PermissionOverride, RoleType, Subject, SubjectType, VaultPermission,
    VaultType,
};
use vaulthalla_core::rbac::{Action, AuthManager};
use vaulthalla_core::storage::{CacheStore, Engine, PathLocks, VaultPaths};
use vaulthalla_core::VaultError;

struct Harness {
    store: Store,
    engine: Engine,
    _dir: TempDir,
}

fn harness() -> Harness {
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
                &query::vault::NewVault {
                    name: "v1",
                    owner_id: 1,
                    description: "",
                    quota_bytes: 0,
                    vault_type: VaultType::Local,
                    mount_path: "/mnt/vaulthalla/v1",
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
    let engine = Engine::new(
        &vault,
        store.clone(),
        Arc::new(KeyRing::ephemeral()),
        paths,
        Arc::new(PathLocks::new()),
        cache,
        tx,
    )
    .unwrap();
    Harness {
        store,
        engine,
        _dir: dir,
    }
}

#[test]
fn test_create_write_read_scenario() {
    // Create /a/b.txt, write "hello world!\n", read it back; the parent
    // directory's aggregates must follow.
    let h = harness();
    h.engine.mkdir("/", "a", 0o755, 1000, 1000).unwrap();
    let file = h.engine.create("/a", "b.txt", 0o644, 1000, 1000).unwrap();
    assert_eq!(file.path, "/a/b.txt");
    assert!(!file.base32_alias.is_empty());

    h.engine.write_full("/a/b.txt", b"hello world!\n").unwrap();

    let entry = h.engine.entry("/a/b.txt").unwrap();
    assert_eq!(entry.size_bytes, 13);

    let parent = h.engine.entry("/a").unwrap();
    let stats = h
        .store
        .with_conn(|c| query::entry::dir_stats(c, parent.id))
        .unwrap();
    assert_eq!(stats.size_bytes, 13);
    assert_eq!(stats.file_count, 1);

    assert_eq!(h.engine.read("/a/b.txt", 0, 64).unwrap(), b"hello world!\n");
}

#[test]
fn test_move_updates_stats_scenario() {
    // /x/y/f (100 bytes) -> /x/z/f: y loses the file, z gains it, x is
    // untouched.
    let h = harness();
    h.engine.mkdir("/", "x", 0o755, 0, 0).unwrap();
    h.engine.mkdir("/x", "y", 0o755, 0, 0).unwrap();
    h.engine.mkdir("/x", "z", 0o755, 0, 0).unwrap();
    h.engine.create("/x/y", "f", 0o644, 0, 0).unwrap();
    h.engine.write_full("/x/y/f", &[7u8; 100]).unwrap();

    let (x, y, z) = (
        h.engine.entry("/x").unwrap(),
        h.engine.entry("/x/y").unwrap(),
        h.engine.entry("/x/z").unwrap(),
    );
    let x_before = h.store.with_conn(|c| query::entry::dir_stats(c, x.id)).unwrap();

    h.engine.rename("/x/y/f", "/x/z/f").unwrap();

    let y_stats = h.store.with_conn(|c| query::entry::dir_stats(c, y.id)).unwrap();
    assert_eq!(y_stats.size_bytes, 0);
    assert_eq!(y_stats.file_count, 0);

    let z_stats = h.store.with_conn(|c| query::entry::dir_stats(c, z.id)).unwrap();
    assert_eq!(z_stats.size_bytes, 100);
    assert_eq!(z_stats.file_count, 1);

    let x_after = h.store.with_conn(|c| query::entry::dir_stats(c, x.id)).unwrap();
    assert_eq!(x_before, x_after);

    // Content survives the move.
    assert_eq!(h.engine.read("/x/z/f", 0, 200).unwrap(), vec![7u8; 100]);
}

#[test]
fn test_override_precedence_scenario() {
    // Base grants download. Group-level deny (vault-wide) is overridden
    // by a user-level allow scoped to /public/.*.
    let h = harness();
    let auth = AuthManager::new(h.store.clone());

    let (user, vault_id) = h
        .store
        .with_txn(|txn| {
            let user_id = query::identity::add_user(txn, "u", 1000, None)?;
            let group_id = query::identity::add_group(txn, "g", 2000)?;
            query::identity::add_group_member(txn, group_id, user_id)?;

            let role_id = query::rbac::add_role(
                txn,
                "downloader",
                RoleType::Vault,
                "",
                VaultPermission::Download.mask(),
            )?;
            query::rbac::assign_vault_role(
                txn,
                1,
                Subject {
                    subject_type: SubjectType::User,
                    subject_id: user_id,
                },
                role_id,
            )?;

            query::rbac::add_override(
                txn,
                &PermissionOverride {
                    id: 0,
                    vault_id: 1,
                    subject: Subject {
                        subject_type: SubjectType::Group,
                        subject_id: group_id,
                    },
                    bit_position: VaultPermission::Download.bit(),
                    effect: OverrideEffect::Deny,
                    path_pattern: None,
                },
            )?;
            query::rbac::add_override(
                txn,
                &PermissionOverride {
                    id: 0,
                    vault_id: 1,
                    subject: Subject {
                        subject_type: SubjectType::User,
                        subject_id: user_id,
                    },
                    bit_position: VaultPermission::Download.bit(),
                    effect: OverrideEffect::Allow,
                    path_pattern: Some("/public/.*".into()),
                },
            )?;

            let user = query::identity::get_user(txn, user_id)?.unwrap();
            Ok((user, 1))
        })
        .unwrap();

    let allowed = auth
        .check(
            &user,
            Action::Vault(VaultPermission::Download),
            vault_id,
            "/public/file",
        )
        .unwrap();
    assert!(allowed, "scoped user allow wins on /public/file");

    let denied = auth
        .check(
            &user,
            Action::Vault(VaultPermission::Download),
            vault_id,
            "/private/file",
        )
        .unwrap();
    assert!(!denied, "group deny applies where the allow pattern misses");
}

#[test]
fn test_unlink_then_restore_view() {
    let h = harness();
    h.engine.mkdir("/", "docs", 0o755, 0, 0).unwrap();
    h.engine.create("/docs", "keep", 0o644, 0, 0).unwrap();
    h.engine.create("/docs", "gone", 0o644, 0, 0).unwrap();
    h.engine.write_full("/docs/gone", b"bye").unwrap();

    h.engine.unlink("/docs/gone", 1).unwrap();

    // Live listing is clean, trash remembers.
    let names: Vec<String> = h
        .engine
        .listdir("/docs")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["keep"]);

    let trashed = h.engine.trashed().unwrap();
    assert_eq!(trashed.len(), 1);
    assert_eq!(trashed[0].path, "/docs/gone");
    assert_eq!(trashed[0].deleted_by, 1);
}

#[test]
fn test_stats_consistency_after_mixed_mutations() {
    // Property 1: after any transaction, stored dir stats equal the
    // recomputed aggregation over immediate children.
    let h = harness();
    h.engine.mkdir("/", "a", 0o755, 0, 0).unwrap();
    h.engine.mkdir("/a", "b", 0o755, 0, 0).unwrap();
    h.engine.create("/a", "f1", 0o644, 0, 0).unwrap();
    h.engine.write_full("/a/f1", &[1u8; 10]).unwrap();
    h.engine.create("/a/b", "f2", 0o644, 0, 0).unwrap();
    h.engine.write_full("/a/b/f2", &[2u8; 20]).unwrap();
    h.engine.rename("/a/f1", "/a/b/f1").unwrap();
    h.engine.truncate("/a/b/f2", 5).unwrap();
    h.engine.unlink("/a/b/f1", 1).unwrap();

    let root = h.engine.root().unwrap();
    let mut pending = vec![root.id];
    while let Some(dir_id) = pending.pop() {
        h.store
            .with_conn(|conn| {
                let stored = query::entry::dir_stats(conn, dir_id)?;
                let recomputed = query::entry::recompute_dir_stats(conn, dir_id)?;
                assert_eq!(stored, recomputed, "stats diverged for dir {dir_id}");
                for child in query::entry::children(conn, dir_id)? {
                    if child.is_dir() {
                        pending.push(child.id);
                    }
                }
                Ok(())
            })
            .unwrap();
    }
}

#[test]
fn test_admin_actions_ignore_overrides() {
    let h = harness();
    let auth = AuthManager::new(h.store.clone());

    let user = h
        .store
        .with_txn(|txn| {
            let role_id = query::rbac::add_role(
                txn,
                "admin",
                RoleType::User,
                "",
                vaulthalla_core::model::AdminPermission::ManageVaults.mask(),
            )?;
            let user_id = query::identity::add_user(txn, "root-ish", 500, Some(role_id))?;
            Ok(query::identity::get_user(txn, user_id)?.unwrap())
        })
        .unwrap();

    let allowed = auth
        .check(
            &user,
            Action::Admin(vaulthalla_core::model::AdminPermission::ManageVaults),
            0,
            "/",
        )
        .unwrap();
    assert!(allowed);

    let denied = auth
        .check(
            &user,
            Action::Admin(vaulthalla_core::model::AdminPermission::ManageUsers),
            0,
            "/",
        )
        .unwrap();
    assert!(!denied);
}

#[test]
fn test_write_read_through_reopen() {
    // Round-trip property: what the engine wrote is what it serves, even
    // after the cache is gone.
    let h = harness();
    h.engine.create("/", "f", 0o644, 0, 0).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    h.engine.write_full("/f", &payload).unwrap();

    assert_eq!(h.engine.read("/f", 0, 20_000).unwrap(), payload);
    assert_eq!(h.engine.read("/f", 9_990, 100).unwrap(), &payload[9_990..]);
}

#[test]
fn test_not_found_taxonomy_surface() {
    let h = harness();
    assert!(matches!(
        h.engine.read("/missing", 0, 1).unwrap_err(),
        VaultError::NotFound(_)
    ));
    assert!(matches!(
        h.engine.rename("/missing", "/also-missing").unwrap_err(),
        VaultError::NotFound(_)
    ));
    assert!(matches!(
        h.engine.mkdir("/missing", "sub", 0o755, 0, 0).unwrap_err(),
        VaultError::NotFound(_)
    ));
}
