//! `users`, `groups`, membership, and `api_keys` queries.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::now_ts;
use crate::db::row::FromRow;
use crate::error::{Result, VaultError};
use crate::model::{ApiKey, Group, User};

const USER_COLS: &str = "id, name, uid, admin_role_id, created_at";
const GROUP_COLS: &str = "id, name, gid, created_at";
const API_KEY_COLS: &str =
    "id, user_id, name, access_key, secret_access_key, region, endpoint, provider";

// --- users ---------------------------------------------------------------

pub fn add_user(
    conn: &Connection,
    name: &str,
    uid: u32,
    admin_role_id: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO users (name, uid, admin_role_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, uid, admin_role_id, now_ts()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_user(conn: &Connection, id: i64) -> Result<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE id = ?1"))?;
    stmt.query_row(params![id], |row| Ok(User::from_row(row)))
        .optional()?
        .transpose()
}

/// Resolve the daemon user bound to a POSIX uid, as seen on FUSE calls.
pub fn get_user_by_uid(conn: &Connection, uid: u32) -> Result<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE uid = ?1"))?;
    stmt.query_row(params![uid], |row| Ok(User::from_row(row)))
        .optional()?
        .transpose()
}

pub fn get_user_by_name(conn: &Connection, name: &str) -> Result<Option<User>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE name = ?1"))?;
    stmt.query_row(params![name], |row| Ok(User::from_row(row)))
        .optional()?
        .transpose()
}

pub fn set_admin_role(conn: &Connection, user_id: i64, role_id: Option<i64>) -> Result<()> {
    let n = conn.execute(
        "UPDATE users SET admin_role_id = ?2 WHERE id = ?1",
        params![user_id, role_id],
    )?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("user id {user_id}")));
    }
    Ok(())
}

pub fn delete_user(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("user id {id}")));
    }
    Ok(())
}

// --- groups --------------------------------------------------------------

pub fn add_group(conn: &Connection, name: &str, gid: u32) -> Result<i64> {
    conn.execute(
        "INSERT INTO \"groups\" (name, gid, created_at) VALUES (?1, ?2, ?3)",
        params![name, gid, now_ts()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_group(conn: &Connection, id: i64) -> Result<Option<Group>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {GROUP_COLS} FROM \"groups\" WHERE id = ?1"))?;
    stmt.query_row(params![id], |row| Ok(Group::from_row(row)))
        .optional()?
        .transpose()
}

pub fn delete_group(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM \"groups\" WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("group id {id}")));
    }
    Ok(())
}

pub fn add_group_member(conn: &Connection, group_id: i64, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
        params![group_id, user_id],
    )?;
    Ok(())
}

pub fn remove_group_member(conn: &Connection, group_id: i64, user_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
    )?;
    Ok(())
}

/// Ids of every group the user belongs to.
pub fn groups_of_user(conn: &Connection, user_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT group_id FROM group_members WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id], |r| r.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- api keys ------------------------------------------------------------

/// Insert an API key. `secret_sealed` must already be encrypted under the
/// daemon master key; plaintext secrets never hit the store.
pub fn add_api_key(conn: &Connection, key: &ApiKey, secret_sealed: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO api_keys (user_id, name, access_key, secret_access_key, region, endpoint, provider) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            key.user_id,
            key.name,
            key.access_key,
            secret_sealed,
            key.region,
            key.endpoint,
            key.provider
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fetch a key with its secret still sealed.
pub fn get_api_key(conn: &Connection, id: i64) -> Result<Option<ApiKey>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {API_KEY_COLS} FROM api_keys WHERE id = ?1"))?;
    stmt.query_row(params![id], |row| Ok(ApiKey::from_row(row)))
        .optional()?
        .transpose()
}

pub fn list_api_keys_for_user(conn: &Connection, user_id: i64) -> Result<Vec<ApiKey>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {API_KEY_COLS} FROM api_keys WHERE user_id = ?1 ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![user_id], |row| Ok(ApiKey::from_row(row)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn delete_api_key(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("api key id {id}")));
    }
    Ok(())
}
