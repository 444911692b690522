//! `fs_entry`, `dir_stats`, and `trashed_file` queries.
//!
//! Aggregation contract: for any directory `D`, `dir_stats(D)` equals the
//! sum over immediate children of `(child.size, 1_if_file, 1_if_dir)`,
//! where a subdirectory contributes its own aggregate size. Size deltas
//! therefore propagate up the whole ancestor chain while file/subdir
//! counters change only on the immediate parent. All chain walks are
//! iterative cursors over `(parent_id, path)`; no recursion.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::now_ts;
use crate::db::row::FromRow;
use crate::error::{Result, VaultError};
use crate::model::entry::{common_prefix, parent_of};
use crate::model::{DirStats, EntryKind, FSEntry, TrashedFile};

const ENTRY_COLS: &str = "id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, \
     mode, owner_uid, group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, \
     encryption_iv, key_version, created_at, updated_at";

pub(crate) const SQL_GET_BY_PATH: &str = "SELECT id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, mode, owner_uid, \
     group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, encryption_iv, \
     key_version, created_at, updated_at FROM fs_entry WHERE vault_id = ?1 AND path = ?2";

pub(crate) const SQL_GET_BY_ID: &str = "SELECT id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, mode, owner_uid, \
     group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, encryption_iv, \
     key_version, created_at, updated_at FROM fs_entry WHERE id = ?1";

pub(crate) const SQL_GET_BY_INODE: &str = "SELECT id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, mode, owner_uid, \
     group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, encryption_iv, \
     key_version, created_at, updated_at FROM fs_entry WHERE inode = ?1";

pub(crate) const SQL_CHILDREN: &str = "SELECT id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, mode, owner_uid, \
     group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, encryption_iv, \
     key_version, created_at, updated_at FROM fs_entry WHERE parent_id = ?1 ORDER BY is_dir DESC, name";

pub(crate) const SQL_CHILD_BY_NAME: &str = "SELECT id, vault_id, parent_id, name, base32_alias, path, inode, is_dir, mode, owner_uid, \
     group_gid, is_hidden, is_system, size_bytes, mime_type, content_hash, encryption_iv, \
     key_version, created_at, updated_at FROM fs_entry WHERE parent_id = ?1 AND name = ?2";

pub(crate) const SQL_APPLY_STATS: &str = "UPDATE dir_stats SET size_bytes = size_bytes + ?2, file_count = file_count + ?3, \
     subdirectory_count = subdirectory_count + ?4 WHERE dir_id = ?1";

pub(crate) const SQL_PARENT_ID: &str = "SELECT parent_id, path FROM fs_entry WHERE id = ?1";

/// A new `fs_entry` row about to be inserted.
pub struct NewEntry<'a> {
    pub vault_id: i64,
    pub parent_id: i64,
    pub name: &'a str,
    pub base32_alias: &'a str,
    pub path: &'a str,
    pub kind: EntryKind,
    pub mode: u32,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub mime_type: Option<&'a str>,
}

pub fn get_by_path(conn: &Connection, vault_id: i64, path: &str) -> Result<Option<FSEntry>> {
    let mut stmt = conn.prepare_cached(SQL_GET_BY_PATH)?;
    stmt.query_row(params![vault_id, path], |row| {
        Ok(FSEntry::from_row(row))
    })
    .optional()?
    .transpose()
}

pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<FSEntry>> {
    let mut stmt = conn.prepare_cached(SQL_GET_BY_ID)?;
    stmt.query_row(params![id], |row| {
        Ok(FSEntry::from_row(row))
    })
    .optional()?
    .transpose()
}

pub fn require_by_id(conn: &Connection, id: i64) -> Result<FSEntry> {
    get_by_id(conn, id)?.ok_or_else(|| VaultError::NotFound(format!("fs_entry id {id}")))
}

pub fn get_by_inode(conn: &Connection, inode: u64) -> Result<Option<FSEntry>> {
    let mut stmt = conn.prepare_cached(SQL_GET_BY_INODE)?;
    stmt.query_row(params![inode as i64], |row| {
        Ok(FSEntry::from_row(row))
    })
    .optional()?
    .transpose()
}

/// Merged file + subdirectory rows for a directory listing.
pub fn children(conn: &Connection, parent_id: i64) -> Result<Vec<FSEntry>> {
    let mut stmt = conn.prepare_cached(SQL_CHILDREN)?;
    let rows = stmt.query_map(params![parent_id], |row| {
        Ok(FSEntry::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn child_by_name(conn: &Connection, parent_id: i64, name: &str) -> Result<Option<FSEntry>> {
    let mut stmt = conn.prepare_cached(SQL_CHILD_BY_NAME)?;
    stmt.query_row(params![parent_id, name], |row| {
        Ok(FSEntry::from_row(row))
    })
    .optional()?
    .transpose()
}

pub fn child_count(conn: &Connection, parent_id: i64) -> Result<i64> {
    let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM fs_entry WHERE parent_id = ?1")?;
    Ok(stmt.query_row(params![parent_id], |r| r.get(0))?)
}

/// Allocate the next daemon-wide unique inode.
pub fn next_inode(conn: &Connection) -> Result<u64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(inode), 1) FROM fs_entry",
        [],
        |r| r.get(0),
    )?;
    Ok((max + 1) as u64)
}

/// The global root row (`vault_id` 0, `parent_id` NULL). Created lazily.
pub fn ensure_global_root(conn: &Connection) -> Result<i64> {
    if let Some(root) = get_by_path(conn, 0, "/")? {
        return Ok(root.id);
    }
    let now = now_ts();
    conn.execute(
        "INSERT INTO fs_entry (vault_id, parent_id, name, base32_alias, path, inode, is_dir, \
         mode, size_bytes, created_at, updated_at) \
         VALUES (0, NULL, '', 'root', '/', 1, 1, 493, 0, ?1, ?1)",
        params![now],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO dir_stats (dir_id) VALUES (?1)",
        params![id],
    )?;
    Ok(id)
}

/// The vault root row: path `/`, parented on the global root sentinel.
pub fn ensure_vault_root(conn: &Connection, vault_id: i64) -> Result<FSEntry> {
    if let Some(root) = get_by_path(conn, vault_id, "/")? {
        return Ok(root);
    }
    let global_root = ensure_global_root(conn)?;
    let inode = next_inode(conn)?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO fs_entry (vault_id, parent_id, name, base32_alias, path, inode, is_dir, \
         mode, size_bytes, created_at, updated_at) \
         VALUES (?1, ?2, '', ?3, '/', ?4, 1, 493, 0, ?5, ?5)",
        params![
            vault_id,
            global_root,
            format!("vault-{vault_id}"),
            inode as i64,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute("INSERT INTO dir_stats (dir_id) VALUES (?1)", params![id])?;
    require_by_id(conn, id)
}

pub fn vault_root(conn: &Connection, vault_id: i64) -> Result<FSEntry> {
    get_by_path(conn, vault_id, "/")?
        .ok_or_else(|| VaultError::NotFound(format!("vault {vault_id} root")))
}

/// Insert a file or directory row, allocate its inode, create the
/// `dir_stats` row for directories, and bump the parent chain.
pub fn insert_entry(conn: &Connection, new: &NewEntry<'_>) -> Result<FSEntry> {
    if child_by_name(conn, new.parent_id, new.name)?.is_some() {
        return Err(VaultError::AlreadyExists(format!(
            "{} under parent {}",
            new.name, new.parent_id
        )));
    }

    let inode = next_inode(conn)?;
    let now = now_ts();
    let is_dir = new.kind.is_dir();
    conn.execute(
        "INSERT INTO fs_entry (vault_id, parent_id, name, base32_alias, path, inode, is_dir, \
         mode, owner_uid, group_gid, size_bytes, mime_type, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?12)",
        params![
            new.vault_id,
            new.parent_id,
            new.name,
            new.base32_alias,
            new.path,
            inode as i64,
            is_dir,
            new.mode,
            new.owner_uid,
            new.group_gid,
            new.mime_type,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    if is_dir {
        conn.execute("INSERT INTO dir_stats (dir_id) VALUES (?1)", params![id])?;
        apply_stats(conn, new.parent_id, 0, 0, 1)?;
    } else {
        apply_stats(conn, new.parent_id, 0, 1, 0)?;
    }

    require_by_id(conn, id)
}

/// Add deltas to one directory's stats row.
pub fn apply_stats(
    conn: &Connection,
    dir_id: i64,
    size_delta: i64,
    file_delta: i64,
    subdir_delta: i64,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(SQL_APPLY_STATS)?;
    stmt.execute(params![dir_id, size_delta, file_delta, subdir_delta])?;
    Ok(())
}

pub fn dir_stats(conn: &Connection, dir_id: i64) -> Result<DirStats> {
    let mut stmt = conn.prepare_cached(
        "SELECT dir_id, size_bytes, file_count, subdirectory_count FROM dir_stats WHERE dir_id = ?1",
    )?;
    stmt.query_row(params![dir_id], |row| {
        Ok(DirStats::from_row(row))
    })
    .optional()?
    .transpose()?
    .ok_or_else(|| VaultError::NotFound(format!("dir_stats for {dir_id}")))
}

/// Recompute a directory's stats from its immediate children. Used by
/// consistency checks; the steady-state path maintains stats by delta.
pub fn recompute_dir_stats(conn: &Connection, dir_id: i64) -> Result<DirStats> {
    let mut out = DirStats {
        dir_id,
        ..DirStats::default()
    };
    for child in children(conn, dir_id)? {
        if child.is_dir() {
            out.subdirectory_count += 1;
            out.size_bytes += dir_stats(conn, child.id)?.size_bytes;
        } else {
            out.file_count += 1;
            out.size_bytes += child.size_bytes as i64;
        }
    }
    Ok(out)
}

/// Cursor step: `(parent_id, path)` of an entry.
fn parent_cursor(conn: &Connection, id: i64) -> Result<(Option<i64>, String)> {
    let mut stmt = conn.prepare_cached(SQL_PARENT_ID)?;
    Ok(stmt.query_row(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?)
}

/// Propagate a size delta from `start_dir` up the ancestor chain,
/// stopping after the directory whose path is `stop_at_path` would be
/// reached (exclusive), or at the vault root.
fn propagate_size(
    conn: &Connection,
    vault_id: i64,
    start_dir: Option<i64>,
    size_delta: i64,
    stop_at_path: Option<&str>,
) -> Result<()> {
    let mut cursor = start_dir;
    while let Some(dir_id) = cursor {
        let dir = require_by_id(conn, dir_id)?;
        if dir.vault_id != vault_id {
            break; // crossed into the global root
        }
        if let Some(stop) = stop_at_path {
            if dir.path == stop {
                break;
            }
        }
        apply_stats(conn, dir_id, size_delta, 0, 0)?;
        let (parent, _) = parent_cursor(conn, dir_id)?;
        cursor = parent;
    }
    Ok(())
}

/// Update a file's content metadata after a write and propagate the size
/// delta up the chain.
pub fn update_file_content(
    conn: &Connection,
    file: &FSEntry,
    new_size: u64,
    content_hash: &str,
    iv_b64: &str,
    key_version: i64,
) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE fs_entry SET size_bytes = ?2, content_hash = ?3, encryption_iv = ?4, \
         key_version = ?5, updated_at = ?6 WHERE id = ?1",
        params![file.id, new_size as i64, content_hash, iv_b64, key_version, now],
    )?;

    let delta = new_size as i64 - file.size_bytes as i64;
    if delta != 0 {
        propagate_size(conn, file.vault_id, file.parent_id, delta, None)?;
    }
    Ok(())
}

pub fn set_attr(
    conn: &Connection,
    id: i64,
    mode: Option<u32>,
    owner_uid: Option<u32>,
    group_gid: Option<u32>,
) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE fs_entry SET \
         mode = COALESCE(?2, mode), \
         owner_uid = COALESCE(?3, owner_uid), \
         group_gid = COALESCE(?4, group_gid), \
         updated_at = ?5 WHERE id = ?1",
        params![id, mode, owner_uid, group_gid, now],
    )?;
    Ok(())
}

/// Move/rename an entry.
///
/// Walks the old parent chain up to the common ancestor subtracting the
/// entry's contribution, rewrites `path`/`parent_id` (and the whole
/// subtree's paths for directories), then walks the new chain adding the
/// symmetric deltas. A rename within the same directory touches no stats;
/// renaming an entry onto its own path is a no-op.
pub fn move_entry(
    conn: &Connection,
    entry: &FSEntry,
    new_parent: &FSEntry,
    new_path: &str,
) -> Result<FSEntry> {
    if entry.path == new_path {
        return Ok(entry.clone());
    }
    if get_by_path(conn, entry.vault_id, new_path)?.is_some() {
        return Err(VaultError::AlreadyExists(new_path.to_string()));
    }

    let common = common_prefix(&entry.path, new_path);
    let (moved_size, file_delta, subdir_delta) = if entry.is_dir() {
        (dir_stats(conn, entry.id)?.size_bytes, 0, 1)
    } else {
        (entry.size_bytes as i64, 1, 0)
    };
    let same_parent = entry.parent_id == Some(new_parent.id);

    if !same_parent {
        // Counters leave the old immediate parent...
        if let Some(old_parent) = entry.parent_id {
            apply_stats(conn, old_parent, 0, -file_delta, -subdir_delta)?;
        }
        // ...and the size leaves the old chain up to the common ancestor.
        propagate_size(conn, entry.vault_id, entry.parent_id, -moved_size, Some(&common))?;
    }

    let new_name = new_path.rsplit('/').next().unwrap_or(entry.name.as_str());
    let now = now_ts();
    conn.execute(
        "UPDATE fs_entry SET parent_id = ?2, name = ?3, path = ?4, updated_at = ?5 WHERE id = ?1",
        params![entry.id, new_parent.id, new_name, new_path, now],
    )?;

    if entry.is_dir() {
        // Rewrite descendant paths; backing paths are alias-based and stable.
        conn.execute(
            "UPDATE fs_entry SET path = ?3 || substr(path, length(?2) + 1) \
             WHERE vault_id = ?1 AND path LIKE ?2 || '/%'",
            params![entry.vault_id, entry.path, new_path],
        )?;
    }

    if !same_parent {
        apply_stats(conn, new_parent.id, 0, file_delta, subdir_delta)?;
        propagate_size(conn, entry.vault_id, Some(new_parent.id), moved_size, Some(&common))?;
    }

    require_by_id(conn, entry.id)
}

/// Soft-delete a file: move the row to `trashed_file` (recording its
/// backing blob), subtract it from the parent chain, then remove ancestor
/// directories that became empty, up to but not including the vault root.
pub fn trash_file(
    conn: &Connection,
    user_id: i64,
    file: &FSEntry,
    backing_path: &str,
) -> Result<()> {
    if file.is_dir() {
        return Err(VaultError::InvalidArgument(format!(
            "{} is a directory",
            file.path
        )));
    }

    conn.execute(
        "INSERT INTO trashed_file (vault_id, name, path, backing_path, size_bytes, deleted_by, trashed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            file.vault_id,
            file.name,
            file.path,
            backing_path,
            file.size_bytes as i64,
            user_id,
            now_ts()
        ],
    )?;
    conn.execute("DELETE FROM fs_entry WHERE id = ?1", params![file.id])?;

    if let Some(parent) = file.parent_id {
        apply_stats(conn, parent, 0, -1, 0)?;
        propagate_size(conn, file.vault_id, Some(parent), -(file.size_bytes as i64), None)?;
        clean_empty_dirs(conn, file.vault_id, parent)?;
    }
    Ok(())
}

/// Remove now-empty directories climbing from `start_dir`, stopping at
/// the vault root. The emptiness check re-reads the child count each
/// iteration rather than trusting a carried counter.
fn clean_empty_dirs(conn: &Connection, vault_id: i64, start_dir: i64) -> Result<()> {
    let root = vault_root(conn, vault_id)?;
    let mut cursor = Some(start_dir);
    while let Some(dir_id) = cursor {
        if dir_id == root.id {
            break;
        }
        if child_count(conn, dir_id)? != 0 {
            break;
        }
        let (parent, _) = parent_cursor(conn, dir_id)?;
        conn.execute("DELETE FROM fs_entry WHERE id = ?1", params![dir_id])?;
        if let Some(parent_id) = parent {
            apply_stats(conn, parent_id, 0, 0, -1)?;
        }
        cursor = parent;
    }
    Ok(())
}

/// Delete an empty directory.
pub fn remove_dir(conn: &Connection, dir: &FSEntry) -> Result<()> {
    if !dir.is_dir() {
        return Err(VaultError::InvalidArgument(format!("{} is a file", dir.path)));
    }
    if child_count(conn, dir.id)? != 0 {
        return Err(VaultError::InvalidArgument(format!(
            "{} is not empty",
            dir.path
        )));
    }
    conn.execute("DELETE FROM fs_entry WHERE id = ?1", params![dir.id])?;
    if let Some(parent) = dir.parent_id {
        apply_stats(conn, parent, 0, 0, -1)?;
    }
    Ok(())
}

pub fn list_trashed(conn: &Connection, vault_id: i64) -> Result<Vec<TrashedFile>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, vault_id, name, path, backing_path, size_bytes, deleted_by, trashed_at, purged \
         FROM trashed_file WHERE vault_id = ?1 AND purged = 0 ORDER BY trashed_at DESC",
    )?;
    let rows = stmt.query_map(params![vault_id], |row| {
        Ok(TrashedFile::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Mark a trashed file purged once its blob is gone from disk.
pub fn mark_trashed_purged(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute(
        "UPDATE trashed_file SET purged = 1 WHERE id = ?1",
        params![id],
    )?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("trashed_file id {id}")));
    }
    Ok(())
}

/// Files sealed with a key version older than `version`; the re-encryption
/// worklist after a rotation.
pub fn files_older_than_key_version(
    conn: &Connection,
    vault_id: i64,
    version: i64,
) -> Result<Vec<FSEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLS} FROM fs_entry WHERE vault_id = ?1 AND is_dir = 0 AND key_version < ?2"
    ))?;
    let rows = stmt.query_map(params![vault_id, version], |row| {
        Ok(FSEntry::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// All live files of a vault keyed by canonical path, for reconciliation.
pub fn files_by_path(conn: &Connection, vault_id: i64) -> Result<Vec<FSEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLS} FROM fs_entry WHERE vault_id = ?1 AND is_dir = 0"
    ))?;
    let rows = stmt.query_map(params![vault_id], |row| {
        Ok(FSEntry::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Aggregate bytes used by a vault (its root's dir stats).
pub fn vault_usage(conn: &Connection, vault_id: i64) -> Result<u64> {
    let root = vault_root(conn, vault_id)?;
    Ok(dir_stats(conn, root.id)?.size_bytes.max(0) as u64)
}

/// Chain of base32 aliases from just below the vault root down to the
/// entry itself; the backing-path and remote-key segments.
pub fn alias_chain(conn: &Connection, entry: &FSEntry) -> Result<Vec<String>> {
    let mut chain = vec![entry.base32_alias.clone()];
    let mut cursor = entry.parent_id;
    while let Some(id) = cursor {
        let dir = require_by_id(conn, id)?;
        if dir.vault_id != entry.vault_id || dir.path == "/" {
            break;
        }
        chain.push(dir.base32_alias.clone());
        cursor = dir.parent_id;
    }
    chain.reverse();
    Ok(chain)
}

/// Find an entry by its alias chain (remote key segments). Returns `None`
/// as soon as a segment is unknown.
pub fn entry_by_alias_chain(
    conn: &Connection,
    vault_id: i64,
    chain: &[&str],
) -> Result<Option<FSEntry>> {
    let mut cursor = vault_root(conn, vault_id)?;
    for alias in chain {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM fs_entry WHERE parent_id = ?1 AND base32_alias = ?2"
        ))?;
        let next = stmt
            .query_row(params![cursor.id, alias], |row| {
                Ok(FSEntry::from_row(row))
            })
            .optional()?
            .transpose()?;
        match next {
            Some(e) => cursor = e,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

/// Ancestor directories of a canonical path, creating missing ones. Used
/// when a pull materializes a remote file whose directories don't exist
/// locally yet. Returns the direct parent entry.
pub fn ensure_dirs_for(
    conn: &Connection,
    vault_id: i64,
    rel_path: &str,
    mode: u32,
    alias_for: &mut dyn FnMut() -> String,
) -> Result<FSEntry> {
    let parent_path = parent_of(rel_path);
    let mut cursor = vault_root(conn, vault_id)?;
    if parent_path == "/" {
        return Ok(cursor);
    }
    let mut assembled = String::new();
    for seg in parent_path.trim_start_matches('/').split('/') {
        assembled.push('/');
        assembled.push_str(seg);
        cursor = match get_by_path(conn, vault_id, &assembled)? {
            Some(dir) => dir,
            None => {
                let alias = alias_for();
                insert_entry(
                    conn,
                    &NewEntry {
                        vault_id,
                        parent_id: cursor.id,
                        name: seg,
                        base32_alias: &alias,
                        path: &assembled,
                        kind: EntryKind::Directory,
                        mode,
                        owner_uid: 0,
                        group_gid: 0,
                        mime_type: None,
                    },
                )?
            }
        };
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::model::entry::join_rel;

    fn setup() -> (Store, FSEntry) {
        let store = Store::open_in_memory().unwrap();
        let root = store
            .with_txn(|txn| ensure_vault_root(txn, 1))
            .unwrap();
        (store, root)
    }

    fn mkdir(store: &Store, parent: &FSEntry, name: &str) -> FSEntry {
        let path = join_rel(&parent.path, name);
        store
            .with_txn(|txn| {
                insert_entry(
                    txn,
                    &NewEntry {
                        vault_id: parent.vault_id,
                        parent_id: parent.id,
                        name,
                        base32_alias: &crate::crypto::new_base32_alias(),
                        path: &path,
                        kind: EntryKind::Directory,
                        mode: 0o755,
                        owner_uid: 0,
                        group_gid: 0,
                        mime_type: None,
                    },
                )
            })
            .unwrap()
    }

    fn mkfile(store: &Store, parent: &FSEntry, name: &str, size: u64) -> FSEntry {
        let path = join_rel(&parent.path, name);
        let file = store
            .with_txn(|txn| {
                insert_entry(
                    txn,
                    &NewEntry {
                        vault_id: parent.vault_id,
                        parent_id: parent.id,
                        name,
                        base32_alias: &crate::crypto::new_base32_alias(),
                        path: &path,
                        kind: EntryKind::File,
                        mode: 0o644,
                        owner_uid: 0,
                        group_gid: 0,
                        mime_type: Some("text/plain"),
                    },
                )
            })
            .unwrap();
        store
            .with_txn(|txn| update_file_content(txn, &file, size, "hash", "iv", 1))
            .unwrap();
        store.with_conn(|c| require_by_id(c, file.id)).unwrap()
    }

    fn assert_stats_consistent(store: &Store, dir_id: i64) {
        store
            .with_conn(|conn| {
                let stored = dir_stats(conn, dir_id)?;
                let recomputed = recompute_dir_stats(conn, dir_id)?;
                assert_eq!(stored, recomputed, "dir_stats diverged for {dir_id}");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_create_write_updates_parent_stats() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let f = mkfile(&store, &a, "b.txt", 13);

        assert_eq!(f.path, "/a/b.txt");
        assert_eq!(f.size_bytes, 13);
        assert!(!f.base32_alias.is_empty());

        let stats = store.with_conn(|c| dir_stats(c, a.id)).unwrap();
        assert_eq!(stats.size_bytes, 13);
        assert_eq!(stats.file_count, 1);

        // Size reaches the vault root; file counters stay on the parent.
        let root_stats = store.with_conn(|c| dir_stats(c, root.id)).unwrap();
        assert_eq!(root_stats.size_bytes, 13);
        assert_eq!(root_stats.file_count, 0);
        assert_eq!(root_stats.subdirectory_count, 1);

        assert_stats_consistent(&store, a.id);
        assert_stats_consistent(&store, root.id);
    }

    #[test]
    fn test_move_updates_stats_at_common_ancestor() {
        let (store, root) = setup();
        let x = mkdir(&store, &root, "x");
        let y = mkdir(&store, &x, "y");
        let z = mkdir(&store, &x, "z");
        let f = mkfile(&store, &y, "f", 100);

        let x_before = store.with_conn(|c| dir_stats(c, x.id)).unwrap();

        store
            .with_txn(|txn| move_entry(txn, &f, &z, "/x/z/f"))
            .unwrap();

        let ys = store.with_conn(|c| dir_stats(c, y.id)).unwrap();
        assert_eq!(ys.size_bytes, 0);
        assert_eq!(ys.file_count, 0);

        let zs = store.with_conn(|c| dir_stats(c, z.id)).unwrap();
        assert_eq!(zs.size_bytes, 100);
        assert_eq!(zs.file_count, 1);

        // The common ancestor is untouched.
        let x_after = store.with_conn(|c| dir_stats(c, x.id)).unwrap();
        assert_eq!(x_before, x_after);

        for dir in [x.id, y.id, z.id, root.id] {
            assert_stats_consistent(&store, dir);
        }
    }

    #[test]
    fn test_move_to_same_path_is_noop() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let f = mkfile(&store, &a, "f", 10);

        let before = store.with_conn(|c| dir_stats(c, a.id)).unwrap();
        let moved = store
            .with_txn(|txn| move_entry(txn, &f, &a, "/a/f"))
            .unwrap();
        assert_eq!(moved.id, f.id);
        assert_eq!(moved.updated_at, f.updated_at);
        let after = store.with_conn(|c| dir_stats(c, a.id)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rename_within_dir_keeps_stats() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let f = mkfile(&store, &a, "old", 42);

        let before = store.with_conn(|c| dir_stats(c, a.id)).unwrap();
        let renamed = store
            .with_txn(|txn| move_entry(txn, &f, &a, "/a/new"))
            .unwrap();
        assert_eq!(renamed.name, "new");
        let after = store.with_conn(|c| dir_stats(c, a.id)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_move_directory_rewrites_subtree_paths() {
        let (store, root) = setup();
        let src = mkdir(&store, &root, "src");
        let sub = mkdir(&store, &src, "sub");
        let _f = mkfile(&store, &sub, "deep.txt", 7);
        let dst = mkdir(&store, &root, "dst");

        store
            .with_txn(|txn| move_entry(txn, &sub, &dst, "/dst/sub"))
            .unwrap();

        store
            .with_conn(|conn| {
                assert!(get_by_path(conn, 1, "/dst/sub/deep.txt")?.is_some());
                assert!(get_by_path(conn, 1, "/src/sub/deep.txt")?.is_none());
                Ok(())
            })
            .unwrap();

        let src_stats = store.with_conn(|c| dir_stats(c, src.id)).unwrap();
        assert_eq!(src_stats.size_bytes, 0);
        assert_eq!(src_stats.subdirectory_count, 0);
        let dst_stats = store.with_conn(|c| dir_stats(c, dst.id)).unwrap();
        assert_eq!(dst_stats.size_bytes, 7);
        assert_eq!(dst_stats.subdirectory_count, 1);
    }

    #[test]
    fn test_move_onto_existing_target_fails() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let f = mkfile(&store, &a, "f", 1);
        let _g = mkfile(&store, &a, "g", 2);

        let err = store
            .with_txn(|txn| move_entry(txn, &f, &a, "/a/g"))
            .unwrap_err();
        assert!(matches!(err, VaultError::AlreadyExists(_)));
    }

    #[test]
    fn test_trash_file_moves_row_and_cleans_empty_dirs() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let b = mkdir(&store, &a, "b");
        let f = mkfile(&store, &b, "f", 50);

        store
            .with_txn(|txn| trash_file(txn, 1, &f, "/backing/xx/yy"))
            .unwrap();

        store
            .with_conn(|conn| {
                // Row moved to trash, live view clean.
                assert!(get_by_path(conn, 1, "/a/b/f")?.is_none());
                let trashed = list_trashed(conn, 1)?;
                assert_eq!(trashed.len(), 1);
                assert_eq!(trashed[0].path, "/a/b/f");
                assert_eq!(trashed[0].size_bytes, 50);

                // Both now-empty ancestors are gone, the vault root stays.
                assert!(get_by_path(conn, 1, "/a/b")?.is_none());
                assert!(get_by_path(conn, 1, "/a")?.is_none());
                let root_stats = dir_stats(conn, root.id)?;
                assert_eq!(root_stats.size_bytes, 0);
                assert_eq!(root_stats.subdirectory_count, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_trash_keeps_nonempty_ancestors() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let f = mkfile(&store, &a, "f", 5);
        let _g = mkfile(&store, &a, "g", 6);

        store
            .with_txn(|txn| trash_file(txn, 1, &f, "/backing/zz"))
            .unwrap();

        store
            .with_conn(|conn| {
                assert!(get_by_path(conn, 1, "/a")?.is_some());
                let stats = dir_stats(conn, a.id)?;
                assert_eq!(stats.file_count, 1);
                assert_eq!(stats.size_bytes, 6);
                Ok(())
            })
            .unwrap();
        assert_stats_consistent(&store, a.id);
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let _f = mkfile(&store, &a, "f", 1);

        let err = store.with_txn(|txn| remove_dir(txn, &a)).unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }

    #[test]
    fn test_alias_chain_round_trip() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        let b = mkdir(&store, &a, "b");
        let f = mkfile(&store, &b, "f", 1);

        let chain = store.with_conn(|c| alias_chain(c, &f)).unwrap();
        assert_eq!(
            chain,
            vec![
                a.base32_alias.clone(),
                b.base32_alias.clone(),
                f.base32_alias.clone()
            ]
        );

        let refs: Vec<&str> = chain.iter().map(String::as_str).collect();
        let found = store
            .with_conn(|c| entry_by_alias_chain(c, 1, &refs))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, f.id);
    }

    #[test]
    fn test_ensure_dirs_for_creates_missing_ancestors() {
        let (store, _root) = setup();
        let parent = store
            .with_txn(|txn| {
                ensure_dirs_for(txn, 1, "/p/q/r/file.bin", 0o755, &mut || {
                    crate::crypto::new_base32_alias()
                })
            })
            .unwrap();
        assert_eq!(parent.path, "/p/q/r");
        store
            .with_conn(|conn| {
                assert!(get_by_path(conn, 1, "/p")?.is_some());
                assert!(get_by_path(conn, 1, "/p/q")?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (store, root) = setup();
        let _a = mkdir(&store, &root, "a");
        let err = store
            .with_txn(|txn| {
                insert_entry(
                    txn,
                    &NewEntry {
                        vault_id: 1,
                        parent_id: root.id,
                        name: "a",
                        base32_alias: &crate::crypto::new_base32_alias(),
                        path: "/a",
                        kind: EntryKind::Directory,
                        mode: 0o755,
                        owner_uid: 0,
                        group_gid: 0,
                        mime_type: None,
                    },
                )
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::AlreadyExists(_)));
    }

    #[test]
    fn test_vault_usage_tracks_root_aggregate() {
        let (store, root) = setup();
        let a = mkdir(&store, &root, "a");
        mkfile(&store, &a, "f", 1000);
        mkfile(&store, &root, "g", 24);

        let usage = store.with_conn(|c| vault_usage(c, 1)).unwrap();
        assert_eq!(usage, 1024);
    }
}
