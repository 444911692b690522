//! `cache_index` queries.
//!
//! Lookups are always keyed by `(vault_id, path)`; the path alone is
//! ambiguous across vaults.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::now_ts;
use crate::db::row::FromRow;
use crate::error::{Result, VaultError};
use crate::model::{CacheKind, CacheRecord};

const CACHE_COLS: &str = "id, vault_id, file_id, path, kind, size, last_accessed, created_at";

pub(crate) const SQL_GET_BY_PATH: &str = "SELECT id, vault_id, file_id, path, kind, size, last_accessed, created_at \
     FROM cache_index WHERE vault_id = ?1 AND path = ?2";

pub(crate) const SQL_TOUCH: &str =
    "UPDATE cache_index SET last_accessed = ?2 WHERE id = ?1";

/// Insert or refresh the record for a materialized blob.
pub fn upsert(
    conn: &Connection,
    vault_id: i64,
    file_id: i64,
    path: &str,
    kind: CacheKind,
    size: u64,
) -> Result<i64> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO cache_index (vault_id, file_id, path, kind, size, last_accessed, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
         ON CONFLICT (vault_id, path) \
         DO UPDATE SET file_id = excluded.file_id, kind = excluded.kind, \
                       size = excluded.size, last_accessed = excluded.last_accessed",
        params![vault_id, file_id, path, kind.as_str(), size as i64, now],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM cache_index WHERE vault_id = ?1 AND path = ?2",
        params![vault_id, path],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn get_by_path(conn: &Connection, vault_id: i64, path: &str) -> Result<Option<CacheRecord>> {
    let mut stmt = conn.prepare_cached(SQL_GET_BY_PATH)?;
    stmt.query_row(params![vault_id, path], |row| Ok(CacheRecord::from_row(row)))
        .optional()?
        .transpose()
}

/// Refresh the LRU clock for a record.
pub fn touch(conn: &Connection, id: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(SQL_TOUCH)?;
    stmt.execute(params![id, now_ts()])?;
    Ok(())
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM cache_index WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("cache_index id {id}")));
    }
    Ok(())
}

/// Drop every record pointing at a file, when the file itself goes away.
pub fn delete_for_file(conn: &Connection, vault_id: i64, file_id: i64) -> Result<Vec<CacheRecord>> {
    let victims = {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CACHE_COLS} FROM cache_index WHERE vault_id = ?1 AND file_id = ?2"
        ))?;
        let rows = stmt.query_map(params![vault_id, file_id], |row| {
            Ok(CacheRecord::from_row(row))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        out
    };
    conn.execute(
        "DELETE FROM cache_index WHERE vault_id = ?1 AND file_id = ?2",
        params![vault_id, file_id],
    )?;
    Ok(victims)
}

/// Total bytes indexed in the cache.
pub fn total_size(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM cache_index",
        [],
        |r| r.get(0),
    )?;
    Ok(total.max(0) as u64)
}

/// Oldest records first, the eviction scan order.
pub fn lru_candidates(conn: &Connection, limit: usize) -> Result<Vec<CacheRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CACHE_COLS} FROM cache_index ORDER BY last_accessed ASC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit as i64], |row| Ok(CacheRecord::from_row(row)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}
