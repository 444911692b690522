//! `vault` and `sync_policy` queries.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::row::FromRow;
use crate::error::{Result, VaultError};
use crate::model::{SyncPolicy, Vault, VaultType};

const VAULT_COLS: &str =
    "id, name, owner_id, description, quota_bytes, vault_type, mount_path, key_version";

pub struct NewVault<'a> {
    pub name: &'a str,
    pub owner_id: i64,
    pub description: &'a str,
    pub quota_bytes: u64,
    pub vault_type: VaultType,
    pub mount_path: &'a str,
}

pub fn add_vault(conn: &Connection, new: &NewVault<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO vault (name, owner_id, description, quota_bytes, vault_type, mount_path) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.name,
            new.owner_id,
            new.description,
            new.quota_bytes as i64,
            new.vault_type.as_str(),
            new.mount_path
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_vault(conn: &Connection, id: i64) -> Result<Option<Vault>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {VAULT_COLS} FROM vault WHERE id = ?1"))?;
    stmt.query_row(params![id], |row| Ok(Vault::from_row(row)))
        .optional()?
        .transpose()
}

pub fn require_vault(conn: &Connection, id: i64) -> Result<Vault> {
    get_vault(conn, id)?.ok_or_else(|| VaultError::NotFound(format!("vault id {id}")))
}

pub fn get_vault_by_name(conn: &Connection, name: &str) -> Result<Option<Vault>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {VAULT_COLS} FROM vault WHERE name = ?1"))?;
    stmt.query_row(params![name], |row| Ok(Vault::from_row(row)))
        .optional()?
        .transpose()
}

pub fn list_vaults(conn: &Connection) -> Result<Vec<Vault>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {VAULT_COLS} FROM vault ORDER BY name"))?;
    let rows = stmt.query_map([], |row| Ok(Vault::from_row(row)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn delete_vault(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM vault WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("vault id {id}")));
    }
    Ok(())
}

/// Bump the current key version; newly sealed blobs pick it up.
pub fn bump_key_version(conn: &Connection, id: i64) -> Result<i64> {
    conn.execute(
        "UPDATE vault SET key_version = key_version + 1 WHERE id = ?1",
        params![id],
    )?;
    let version: i64 = conn.query_row(
        "SELECT key_version FROM vault WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(version)
}

pub fn upsert_sync_policy(conn: &Connection, policy: &SyncPolicy) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_policy (vault_id, interval_secs, conflict_policy, strategy) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (vault_id) \
         DO UPDATE SET interval_secs = excluded.interval_secs, \
                       conflict_policy = excluded.conflict_policy, \
                       strategy = excluded.strategy",
        params![
            policy.vault_id,
            policy.interval.as_secs() as i64,
            policy.conflict_policy.as_str(),
            policy.strategy.as_str()
        ],
    )?;
    Ok(())
}

pub fn get_sync_policy(conn: &Connection, vault_id: i64) -> Result<Option<SyncPolicy>> {
    let mut stmt = conn.prepare_cached(
        "SELECT vault_id, interval_secs, conflict_policy, strategy FROM sync_policy \
         WHERE vault_id = ?1",
    )?;
    stmt.query_row(params![vault_id], |row| Ok(SyncPolicy::from_row(row)))
        .optional()?
        .transpose()
}
