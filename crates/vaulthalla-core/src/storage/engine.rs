//! The per-vault storage engine.
//!
//! Translates POSIX-shaped operations into metadata-store transactions,
//! backing-tree I/O, cache bookkeeping, and change events for the sync
//! controller. Content is sealed before it touches disk; partial writes
//! go through write-to-temp-then-rename; every path-writing operation
//! holds the path-scoped advisory lock for the transaction plus the I/O.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::crypto::{self, aead, KeyRing};
use crate::db::{query, Store};
use crate::error::{Result, VaultError};
use crate::model::entry::{canonical_rel_path, join_rel, mime_for_name, parent_of};
use crate::model::{EntryKind, FSEntry, TrashedFile, Vault, VaultType};
use crate::storage::cache::CacheStore;
use crate::storage::lock::PathLocks;
use crate::storage::paths::{remote_key, VaultPaths};
use crate::sync::events::ChangeEvent;

/// Pulls a missing ciphertext blob from the remote, on demand.
///
/// Implemented by the S3 client; absent for local vaults.
pub trait RemoteFetcher: Send + Sync {
    /// Fetch the raw sealed blob stored under `key`.
    fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// Storage engine for a single vault.
pub struct Engine {
    vault_id: i64,
    vault_type: VaultType,
    store: Store,
    keys: Arc<KeyRing>,
    paths: Arc<VaultPaths>,
    locks: Arc<PathLocks>,
    cache: Arc<CacheStore>,
    events: Sender<ChangeEvent>,
    fetcher: RwLock<Option<Arc<dyn RemoteFetcher>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("vault_id", &self.vault_id)
            .field("vault_type", &self.vault_type)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        vault: &Vault,
        store: Store,
        keys: Arc<KeyRing>,
        paths: Arc<VaultPaths>,
        locks: Arc<PathLocks>,
        cache: Arc<CacheStore>,
        events: Sender<ChangeEvent>,
    ) -> Result<Self> {
        store.with_txn(|txn| {
            query::entry::ensure_vault_root(txn, vault.id)?;
            Ok(())
        })?;
        fs::create_dir_all(&paths.backing_root)?;
        Ok(Self {
            vault_id: vault.id,
            vault_type: vault.vault_type,
            store,
            keys,
            paths,
            locks,
            cache,
            events,
            fetcher: RwLock::new(None),
        })
    }

    pub fn vault_id(&self) -> i64 {
        self.vault_id
    }

    /// Fresh vault row; key version and quota may change at runtime.
    pub fn vault(&self) -> Result<Vault> {
        self.store
            .with_conn(|conn| query::vault::require_vault(conn, self.vault_id))
    }

    /// Install the remote fetch hook once the sync client exists.
    pub fn set_fetcher(&self, fetcher: Arc<dyn RemoteFetcher>) {
        *self.fetcher.write() = Some(fetcher);
    }

    // --- lookups ---------------------------------------------------------

    pub fn entry(&self, rel_path: &str) -> Result<FSEntry> {
        let rel = canonical_rel_path(rel_path);
        self.store.with_conn(|conn| {
            query::entry::get_by_path(conn, self.vault_id, &rel)?
                .ok_or_else(|| VaultError::NotFound(rel.clone()))
        })
    }

    pub fn try_entry(&self, rel_path: &str) -> Result<Option<FSEntry>> {
        let rel = canonical_rel_path(rel_path);
        self.store
            .with_conn(|conn| query::entry::get_by_path(conn, self.vault_id, &rel))
    }

    pub fn entry_by_inode(&self, inode: u64) -> Result<Option<FSEntry>> {
        self.store
            .with_conn(|conn| query::entry::get_by_inode(conn, inode))
    }

    pub fn child(&self, parent: &FSEntry, name: &str) -> Result<FSEntry> {
        self.store.with_conn(|conn| {
            query::entry::child_by_name(conn, parent.id, name)?
                .ok_or_else(|| VaultError::NotFound(join_rel(&parent.path, name)))
        })
    }

    pub fn root(&self) -> Result<FSEntry> {
        self.store
            .with_conn(|conn| query::entry::vault_root(conn, self.vault_id))
    }

    /// Merged file + subdirectory listing of a directory.
    pub fn listdir(&self, rel_path: &str) -> Result<Vec<FSEntry>> {
        let dir = self.entry(rel_path)?;
        if !dir.is_dir() {
            return Err(VaultError::InvalidArgument(format!(
                "{} is not a directory",
                dir.path
            )));
        }
        self.store.with_conn(|conn| query::entry::children(conn, dir.id))
    }

    /// Remote object key for an entry: `vault-<id>/<alias chain>`.
    pub fn remote_key_for(&self, entry: &FSEntry) -> Result<String> {
        let chain = self
            .store
            .with_conn(|conn| query::entry::alias_chain(conn, entry))?;
        Ok(remote_key(self.vault_id, &chain))
    }

    /// Absolute ciphertext location for an entry.
    pub fn backing_path_for(&self, entry: &FSEntry) -> Result<PathBuf> {
        let chain = self
            .store
            .with_conn(|conn| query::entry::alias_chain(conn, entry))?;
        Ok(self.paths.backing_path(&chain))
    }

    // --- mutations -------------------------------------------------------

    /// Create an empty file under an existing parent directory.
    pub fn create(
        &self,
        parent_rel: &str,
        name: &str,
        mode: u32,
        owner_uid: u32,
        group_gid: u32,
    ) -> Result<FSEntry> {
        let parent_rel = canonical_rel_path(parent_rel);
        let rel = join_rel(&parent_rel, name);
        let _guard = self.locks.lock(self.vault_id, &rel)?;

        let alias = crypto::new_base32_alias();
        let mime = mime_for_name(name);
        let entry = self.store.with_txn(|txn| {
            let parent = query::entry::get_by_path(txn, self.vault_id, &parent_rel)?
                .ok_or_else(|| VaultError::NotFound(parent_rel.clone()))?;
            if !parent.is_dir() {
                return Err(VaultError::InvalidArgument(format!(
                    "{parent_rel} is not a directory"
                )));
            }
            query::entry::insert_entry(
                txn,
                &query::entry::NewEntry {
                    vault_id: self.vault_id,
                    parent_id: parent.id,
                    name,
                    base32_alias: &alias,
                    path: &rel,
                    kind: EntryKind::File,
                    mode,
                    owner_uid,
                    group_gid,
                    mime_type: Some(mime),
                },
            )
        })?;

        // Seal an empty blob so the backing tree and metadata agree from
        // the first moment.
        self.persist_content(&entry, &[])?;
        debug!(vault = self.vault_id, path = %rel, "created file");
        Ok(self.entry(&rel)?)
    }

    /// Create a directory under an existing parent.
    pub fn mkdir(
        &self,
        parent_rel: &str,
        name: &str,
        mode: u32,
        owner_uid: u32,
        group_gid: u32,
    ) -> Result<FSEntry> {
        let parent_rel = canonical_rel_path(parent_rel);
        let rel = join_rel(&parent_rel, name);
        let _guard = self.locks.lock(self.vault_id, &rel)?;

        let alias = crypto::new_base32_alias();
        let entry = self.store.with_txn(|txn| {
            let parent = query::entry::get_by_path(txn, self.vault_id, &parent_rel)?
                .ok_or_else(|| VaultError::NotFound(parent_rel.clone()))?;
            if !parent.is_dir() {
                return Err(VaultError::InvalidArgument(format!(
                    "{parent_rel} is not a directory"
                )));
            }
            query::entry::insert_entry(
                txn,
                &query::entry::NewEntry {
                    vault_id: self.vault_id,
                    parent_id: parent.id,
                    name,
                    base32_alias: &alias,
                    path: &rel,
                    kind: EntryKind::Directory,
                    mode,
                    owner_uid,
                    group_gid,
                    mime_type: None,
                },
            )
        })?;

        fs::create_dir_all(self.backing_path_for(&entry)?)?;
        debug!(vault = self.vault_id, path = %rel, "created directory");
        Ok(entry)
    }

    /// Replace a file's entire content.
    pub fn write_full(&self, rel_path: &str, data: &[u8]) -> Result<()> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        if entry.is_dir() {
            return Err(VaultError::InvalidArgument(format!("{rel} is a directory")));
        }
        self.check_quota(&entry, data.len() as u64)?;
        self.persist_content(&entry, data)
    }

    /// Write a byte range, growing the file if needed.
    pub fn write(&self, rel_path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        if entry.is_dir() {
            return Err(VaultError::InvalidArgument(format!("{rel} is a directory")));
        }

        let mut plaintext = self.load_plaintext(&entry)?;
        let end = offset as usize + data.len();
        if plaintext.len() < end {
            plaintext.resize(end, 0);
        }
        plaintext[offset as usize..end].copy_from_slice(data);

        self.check_quota(&entry, plaintext.len() as u64)?;
        self.persist_content(&entry, &plaintext)?;
        Ok(data.len())
    }

    /// Serve a byte range of the decrypted content.
    pub fn read(&self, rel_path: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        let entry = self.entry(rel_path)?;
        if entry.is_dir() {
            return Err(VaultError::InvalidArgument(format!(
                "{} is a directory",
                entry.path
            )));
        }
        let plaintext = self.load_plaintext(&entry)?;
        let start = (offset as usize).min(plaintext.len());
        let end = (start + size as usize).min(plaintext.len());
        Ok(plaintext[start..end].to_vec())
    }

    /// Truncate (or extend with zeros) to `new_size`.
    pub fn truncate(&self, rel_path: &str, new_size: u64) -> Result<()> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        let mut plaintext = self.load_plaintext(&entry)?;
        plaintext.resize(new_size as usize, 0);
        self.check_quota(&entry, new_size)?;
        self.persist_content(&entry, &plaintext)
    }

    /// chmod / chown.
    pub fn setattr(
        &self,
        rel_path: &str,
        mode: Option<u32>,
        owner_uid: Option<u32>,
        group_gid: Option<u32>,
    ) -> Result<FSEntry> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        self.store
            .with_txn(|txn| query::entry::set_attr(txn, entry.id, mode, owner_uid, group_gid))?;
        self.entry(&rel)
    }

    /// Move or rename an entry. Renames within a directory keep the
    /// backing path (aliases are stable); moves relocate the blob subtree
    /// and re-key the remote objects underneath.
    pub fn rename(&self, old_rel: &str, new_rel: &str) -> Result<FSEntry> {
        let old_rel = canonical_rel_path(old_rel);
        let new_rel = canonical_rel_path(new_rel);
        if old_rel == new_rel {
            return self.entry(&old_rel);
        }
        let (_g1, _g2) = self.locks.lock_pair(self.vault_id, &old_rel, &new_rel)?;

        let entry = self.entry(&old_rel)?;
        let new_parent_rel = parent_of(&new_rel);
        let same_parent = parent_of(&old_rel) == new_parent_rel;

        // Remote keys and backing paths derive from the ancestor alias
        // chain; capture them before the tree changes.
        let old_backing = self.backing_path_for(&entry)?;
        let old_keys: Vec<(i64, String)> = if same_parent {
            Vec::new()
        } else {
            self.descendant_file_keys(&entry)?
        };

        let moved = self.store.with_txn(|txn| {
            let new_parent = query::entry::get_by_path(txn, self.vault_id, &new_parent_rel)?
                .ok_or_else(|| VaultError::NotFound(new_parent_rel.clone()))?;
            if !new_parent.is_dir() {
                return Err(VaultError::InvalidArgument(format!(
                    "{new_parent_rel} is not a directory"
                )));
            }
            query::entry::move_entry(txn, &entry, &new_parent, &new_rel)
        })?;

        if !same_parent {
            let new_backing = self.backing_path_for(&moved)?;
            if let Some(parent) = new_backing.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&old_backing, &new_backing)?;

            for (entry_id, old_key) in old_keys {
                self.emit(ChangeEvent::Remove {
                    remote_key: old_key,
                });
                self.emit(ChangeEvent::Upload { entry_id });
            }
        }

        debug!(vault = self.vault_id, from = %old_rel, to = %new_rel, "renamed");
        Ok(moved)
    }

    /// Soft-delete a file into the trash.
    pub fn unlink(&self, rel_path: &str, user_id: i64) -> Result<()> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        if entry.is_dir() {
            return Err(VaultError::InvalidArgument(format!("{rel} is a directory")));
        }

        let backing = self.backing_path_for(&entry)?;
        let key = self.remote_key_for(&entry)?;

        self.store.with_txn(|txn| {
            query::entry::trash_file(txn, user_id, &entry, &backing.to_string_lossy())?;
            query::cache::delete_for_file(txn, self.vault_id, entry.id)?;
            Ok(())
        })?;
        self.cache.drop_blobs_for(&entry)?;

        self.emit(ChangeEvent::Remove { remote_key: key });
        debug!(vault = self.vault_id, path = %rel, "unlinked");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, rel_path: &str) -> Result<()> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        let backing = self.backing_path_for(&entry)?;

        self.store.with_txn(|txn| query::entry::remove_dir(txn, &entry))?;
        if let Err(e) = fs::remove_dir(&backing) {
            // The backing dir may already be gone; anything else is noise
            // worth surfacing.
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vault = self.vault_id, path = %rel, error = %e, "backing dir removal failed");
            }
        }
        debug!(vault = self.vault_id, path = %rel, "removed directory");
        Ok(())
    }

    // --- trash -----------------------------------------------------------

    pub fn trashed(&self) -> Result<Vec<TrashedFile>> {
        self.store
            .with_conn(|conn| query::entry::list_trashed(conn, self.vault_id))
    }

    /// Hard-delete a trashed file's blob and mark the row purged.
    pub fn purge_trashed(&self, trash_id: i64) -> Result<()> {
        let victim = self.store.with_conn(|conn| {
            let all = query::entry::list_trashed(conn, self.vault_id)?;
            all.into_iter()
                .find(|t| t.id == trash_id)
                .ok_or_else(|| VaultError::NotFound(format!("trashed_file id {trash_id}")))
        })?;
        if let Err(e) = fs::remove_file(&victim.backing_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.store
            .with_txn(|txn| query::entry::mark_trashed_purged(txn, trash_id))
    }

    // --- key rotation ----------------------------------------------------

    /// Bump the vault key version; new writes seal under the new key.
    pub fn rotate_key(&self) -> Result<i64> {
        self.store
            .with_txn(|txn| query::vault::bump_key_version(txn, self.vault_id))
    }

    /// Files still sealed under an older key version.
    pub fn stale_files(&self) -> Result<Vec<FSEntry>> {
        let current = self.vault()?.key_version;
        self.store.with_conn(|conn| {
            query::entry::files_older_than_key_version(conn, self.vault_id, current)
        })
    }

    /// Re-seal one file under the current key version.
    pub fn reencrypt(&self, rel_path: &str) -> Result<()> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        let entry = self.entry(&rel)?;
        let plaintext = self.load_plaintext(&entry)?;
        self.persist_content(&entry, &plaintext)
    }

    // --- sync-controller surface -----------------------------------------

    /// Raw sealed blob bytes, as uploaded to the remote.
    pub fn sealed_bytes(&self, entry: &FSEntry) -> Result<Vec<u8>> {
        self.load_sealed(entry)
    }

    /// Materialize a remote-only object locally: directories along the
    /// path are created reusing the remote alias chain, the blob lands in
    /// the backing tree, and the row records the verified content. Emits
    /// no change events; the remote is already current.
    pub fn adopt_remote(
        &self,
        rel_path: &str,
        alias_chain: &[&str],
        sealed: &[u8],
        key_version: i64,
        expected_hash: Option<&str>,
    ) -> Result<FSEntry> {
        let rel = canonical_rel_path(rel_path);
        let _guard = self.locks.lock(self.vault_id, &rel)?;
        if self.try_entry(&rel)?.is_some() {
            return Err(VaultError::AlreadyExists(rel));
        }

        let (plaintext, nonce_b64) = self.verify_sealed(sealed, key_version, expected_hash)?;
        let hash = crypto::sha256_hex(&plaintext);

        let (file_alias, dir_aliases) = match alias_chain.split_last() {
            Some((last, rest)) => (*last, rest),
            None => {
                return Err(VaultError::InvalidArgument(format!(
                    "empty alias chain for {rel}"
                )));
            }
        };

        let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
        let entry = self.store.with_txn(|txn| {
            let mut next_alias = dir_aliases.iter().map(|a| (*a).to_string());
            let parent = query::entry::ensure_dirs_for(txn, self.vault_id, &rel, 0o755, &mut || {
                next_alias
                    .next()
                    .unwrap_or_else(crypto::new_base32_alias)
            })?;
            let entry = query::entry::insert_entry(
                txn,
                &query::entry::NewEntry {
                    vault_id: self.vault_id,
                    parent_id: parent.id,
                    name: &name,
                    base32_alias: file_alias,
                    path: &rel,
                    kind: EntryKind::File,
                    mode: 0o644,
                    owner_uid: 0,
                    group_gid: 0,
                    mime_type: Some(mime_for_name(&name)),
                },
            )?;
            query::entry::update_file_content(
                txn,
                &entry,
                plaintext.len() as u64,
                &hash,
                &nonce_b64,
                key_version,
            )?;
            Ok(entry)
        })?;

        self.write_sealed(&entry, sealed)?;
        debug!(vault = self.vault_id, path = %rel, "adopted remote object");
        self.entry(&rel)
    }

    /// Overwrite a local file with verified remote content. No change
    /// events; the remote side is the source.
    pub fn replace_from_remote(
        &self,
        entry: &FSEntry,
        sealed: &[u8],
        key_version: i64,
        expected_hash: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.lock(self.vault_id, &entry.path)?;
        let (plaintext, nonce_b64) = self.verify_sealed(sealed, key_version, expected_hash)?;
        let hash = crypto::sha256_hex(&plaintext);

        self.write_sealed(entry, sealed)?;
        self.store.with_txn(|txn| {
            query::entry::update_file_content(
                txn,
                entry,
                plaintext.len() as u64,
                &hash,
                &nonce_b64,
                key_version,
            )?;
            query::cache::delete_for_file(txn, self.vault_id, entry.id)?;
            Ok(())
        })?;
        self.cache.drop_blobs_for(entry)?;
        debug!(vault = self.vault_id, path = %entry.path, "replaced from remote");
        Ok(())
    }

    /// Decrypt and hash-check a downloaded blob. A mismatch is an
    /// integrity failure; the caller must not retry it.
    fn verify_sealed(
        &self,
        sealed: &[u8],
        key_version: i64,
        expected_hash: Option<&str>,
    ) -> Result<(Vec<u8>, String)> {
        let blob = aead::SealedBlob::from_bytes(sealed)?;
        let key = self.keys.vault_key(self.vault_id, key_version);
        let plaintext = aead::open(&key, &blob)?;
        if let Some(expected) = expected_hash {
            let actual = crypto::sha256_hex(&plaintext);
            if actual != expected {
                return Err(VaultError::Integrity(format!(
                    "content hash mismatch after download: {actual} != {expected}"
                )));
            }
        }
        Ok((plaintext, blob.nonce_b64()))
    }

    fn write_sealed(&self, entry: &FSEntry, sealed: &[u8]) -> Result<()> {
        let backing = self.backing_path_for(entry)?;
        let parent = backing
            .parent()
            .ok_or_else(|| VaultError::Io(format!("{} has no parent", backing.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(sealed)?;
        tmp.persist(&backing)
            .map_err(|e| VaultError::Io(format!("atomic replace failed: {e}")))?;
        Ok(())
    }

    // --- internals -------------------------------------------------------

    fn check_quota(&self, entry: &FSEntry, new_size: u64) -> Result<()> {
        let vault = self.vault()?;
        if vault.quota_bytes == 0 {
            return Ok(());
        }
        let usage = self
            .store
            .with_conn(|conn| query::entry::vault_usage(conn, self.vault_id))?;
        let projected = usage - entry.size_bytes.min(usage) + new_size;
        if projected > vault.quota_bytes {
            return Err(VaultError::QuotaExceeded {
                vault_id: self.vault_id,
                quota_bytes: vault.quota_bytes,
            });
        }
        Ok(())
    }

    /// Seal `data` under the vault's current key, atomically replace the
    /// blob, update the metadata row, and invalidate stale cache copies.
    fn persist_content(&self, entry: &FSEntry, data: &[u8]) -> Result<()> {
        let vault = self.vault()?;
        let key = self.keys.vault_key(self.vault_id, vault.key_version);
        let blob = aead::seal(&key, data)?;

        let backing = self.backing_path_for(entry)?;
        let parent = backing
            .parent()
            .ok_or_else(|| VaultError::Io(format!("{} has no parent", backing.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&blob.to_bytes())?;
        tmp.persist(&backing)
            .map_err(|e| VaultError::Io(format!("atomic replace failed: {e}")))?;

        let hash = crypto::sha256_hex(data);
        self.store.with_txn(|txn| {
            query::entry::update_file_content(
                txn,
                entry,
                data.len() as u64,
                &hash,
                &blob.nonce_b64(),
                vault.key_version,
            )?;
            query::cache::delete_for_file(txn, self.vault_id, entry.id)?;
            Ok(())
        })?;
        self.cache.drop_blobs_for(entry)?;

        self.emit(ChangeEvent::Upload { entry_id: entry.id });
        Ok(())
    }

    /// Decrypt an entry's content, serving from the plaintext cache when
    /// warm and materializing it otherwise. Missing blobs of cloud vaults
    /// are fetched on demand.
    fn load_plaintext(&self, entry: &FSEntry) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.read_file(entry)? {
            return Ok(data);
        }

        let sealed = self.load_sealed(entry)?;
        let blob = aead::SealedBlob::from_bytes(&sealed)?;
        let key = self.keys.vault_key(self.vault_id, entry.key_version);
        let plaintext = aead::open(&key, &blob)?;

        self.cache.materialize_file(entry, &plaintext)?;
        Ok(plaintext)
    }

    fn load_sealed(&self, entry: &FSEntry) -> Result<Vec<u8>> {
        let backing = self.backing_path_for(entry)?;
        match fs::read(&backing) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fetcher = self.fetcher.read().clone();
                let Some(fetcher) = fetcher else {
                    return Err(VaultError::NotFound(format!(
                        "ciphertext missing for {}",
                        entry.path
                    )));
                };
                let key = self.remote_key_for(entry)?;
                debug!(vault = self.vault_id, %key, "fetching blob on demand");
                let bytes = fetcher.fetch(&key)?;
                if let Some(parent) = backing.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut tmp = tempfile::NamedTempFile::new_in(
                    backing.parent().unwrap_or(&self.paths.backing_root),
                )?;
                tmp.write_all(&bytes)?;
                tmp.persist(&backing)
                    .map_err(|e| VaultError::Io(format!("atomic replace failed: {e}")))?;
                Ok(bytes)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `(entry_id, current remote key)` for every file at or below an
    /// entry; a single pair for plain files.
    fn descendant_file_keys(&self, entry: &FSEntry) -> Result<Vec<(i64, String)>> {
        if entry.is_file() {
            return Ok(vec![(entry.id, self.remote_key_for(entry)?)]);
        }
        let files = self.store.with_conn(|conn| {
            let all = query::entry::files_by_path(conn, self.vault_id)?;
            Ok(all
                .into_iter()
                .filter(|f| f.path.starts_with(&format!("{}/", entry.path)))
                .collect::<Vec<_>>())
        })?;
        let mut out = Vec::with_capacity(files.len());
        for f in &files {
            out.push((f.id, self.remote_key_for(f)?));
        }
        Ok(out)
    }

    fn emit(&self, event: ChangeEvent) {
        if self.vault_type != VaultType::S3 {
            return;
        }
        if self.events.send(event).is_err() {
            warn!(vault = self.vault_id, "change-event channel closed");
        }
    }
}
