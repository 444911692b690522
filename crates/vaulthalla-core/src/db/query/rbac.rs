//! Roles, vault-role assignments, and permission overrides.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::row::FromRow;
use crate::error::{Result, VaultError};
use crate::model::{
    PermissionOverride, Role, RoleType, Subject, SubjectType, VaultRoleAssignment,
};

const ROLE_COLS: &str = "id, name, role_type, description, permissions";
const OVERRIDE_COLS: &str =
    "id, vault_id, subject_type, subject_id, bit_position, effect, path_pattern";
const ASSIGNMENT_COLS: &str = "id, vault_id, subject_type, subject_id, role_id";

pub(crate) const SQL_VAULT_ROLES_FOR_SUBJECT: &str = "SELECT r.id, r.name, r.role_type, r.description, r.permissions \
     FROM vault_role_assignments a JOIN roles r ON r.id = a.role_id \
     WHERE a.vault_id = ?1 AND a.subject_type = ?2 AND a.subject_id = ?3";

pub(crate) const SQL_OVERRIDES_FOR_SUBJECT: &str = "SELECT id, vault_id, subject_type, subject_id, bit_position, effect, path_pattern \
     FROM permission_overrides WHERE vault_id = ?1 AND subject_type = ?2 AND subject_id = ?3";

// --- role CRUD -----------------------------------------------------------

pub fn add_role(
    conn: &Connection,
    name: &str,
    role_type: RoleType,
    description: &str,
    permissions: u16,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO roles (name, role_type, description, permissions) VALUES (?1, ?2, ?3, ?4)",
        params![name, role_type.as_str(), description, permissions],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_role(conn: &Connection, role: &Role) -> Result<()> {
    let n = conn.execute(
        "UPDATE roles SET name = ?2, description = ?3, permissions = ?4 WHERE id = ?1",
        params![role.id, role.name, role.description, role.permissions],
    )?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("role id {}", role.id)));
    }
    Ok(())
}

pub fn delete_role(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM roles WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("role id {id}")));
    }
    Ok(())
}

pub fn get_role(conn: &Connection, id: i64) -> Result<Option<Role>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {ROLE_COLS} FROM roles WHERE id = ?1"))?;
    stmt.query_row(params![id], |row| Ok(Role::from_row(row)))
        .optional()?
        .transpose()
}

pub fn get_role_by_name(conn: &Connection, name: &str) -> Result<Option<Role>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {ROLE_COLS} FROM roles WHERE name = ?1"))?;
    stmt.query_row(params![name], |row| Ok(Role::from_row(row)))
        .optional()?
        .transpose()
}

pub fn role_exists(conn: &Connection, name: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT EXISTS(SELECT 1 FROM roles WHERE name = ?1)")?;
    Ok(stmt.query_row(params![name], |r| r.get(0))?)
}

pub fn list_roles(conn: &Connection, role_type: Option<RoleType>) -> Result<Vec<Role>> {
    let (sql, ty) = match role_type {
        Some(t) => (
            format!("SELECT {ROLE_COLS} FROM roles WHERE role_type = ?1 ORDER BY name"),
            Some(t.as_str()),
        ),
        None => (format!("SELECT {ROLE_COLS} FROM roles ORDER BY name"), None),
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut out = Vec::new();
    match ty {
        Some(t) => {
            let rows = stmt.query_map(params![t], |row| Ok(Role::from_row(row)))?;
            for row in rows {
                out.push(row??);
            }
        }
        None => {
            let rows = stmt.query_map([], |row| Ok(Role::from_row(row)))?;
            for row in rows {
                out.push(row??);
            }
        }
    }
    Ok(out)
}

// --- vault role assignments ----------------------------------------------

pub fn assign_vault_role(
    conn: &Connection,
    vault_id: i64,
    subject: Subject,
    role_id: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO vault_role_assignments (vault_id, subject_type, subject_id, role_id) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            vault_id,
            subject.subject_type.as_str(),
            subject.subject_id,
            role_id
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn remove_vault_role_assignment(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute(
        "DELETE FROM vault_role_assignments WHERE id = ?1",
        params![id],
    )?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("vault role assignment {id}")));
    }
    Ok(())
}

pub fn list_vault_assignments(conn: &Connection, vault_id: i64) -> Result<Vec<VaultRoleAssignment>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ASSIGNMENT_COLS} FROM vault_role_assignments WHERE vault_id = ?1"
    ))?;
    let rows = stmt.query_map(params![vault_id], |row| {
        Ok(VaultRoleAssignment::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Roles a subject holds in one vault (joined through assignments).
pub fn vault_roles_for_subject(
    conn: &Connection,
    vault_id: i64,
    subject: Subject,
) -> Result<Vec<Role>> {
    let mut stmt = conn.prepare_cached(SQL_VAULT_ROLES_FOR_SUBJECT)?;
    let rows = stmt.query_map(
        params![vault_id, subject.subject_type.as_str(), subject.subject_id],
        |row| Ok(Role::from_row(row)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

// --- permission overrides ------------------------------------------------

pub fn add_override(conn: &Connection, ov: &PermissionOverride) -> Result<i64> {
    conn.execute(
        "INSERT INTO permission_overrides \
         (vault_id, subject_type, subject_id, bit_position, effect, path_pattern) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            ov.vault_id,
            ov.subject.subject_type.as_str(),
            ov.subject.subject_id,
            ov.bit_position,
            ov.effect.as_str(),
            ov.path_pattern
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_override(conn: &Connection, ov: &PermissionOverride) -> Result<()> {
    let n = conn.execute(
        "UPDATE permission_overrides SET bit_position = ?2, effect = ?3, path_pattern = ?4 \
         WHERE id = ?1",
        params![ov.id, ov.bit_position, ov.effect.as_str(), ov.path_pattern],
    )?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("override id {}", ov.id)));
    }
    Ok(())
}

pub fn remove_override(conn: &Connection, id: i64) -> Result<()> {
    let n = conn.execute("DELETE FROM permission_overrides WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(VaultError::NotFound(format!("override id {id}")));
    }
    Ok(())
}

pub fn list_overrides(conn: &Connection, vault_id: i64) -> Result<Vec<PermissionOverride>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OVERRIDE_COLS} FROM permission_overrides WHERE vault_id = ?1"
    ))?;
    let rows = stmt.query_map(params![vault_id], |row| {
        Ok(PermissionOverride::from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Overrides targeting one subject in one vault.
pub fn overrides_for_subject(
    conn: &Connection,
    vault_id: i64,
    subject: Subject,
) -> Result<Vec<PermissionOverride>> {
    let mut stmt = conn.prepare_cached(SQL_OVERRIDES_FOR_SUBJECT)?;
    let rows = stmt.query_map(
        params![vault_id, subject.subject_type.as_str(), subject.subject_id],
        |row| Ok(PermissionOverride::from_row(row)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::model::{OverrideEffect, VaultPermission};

    #[test]
    fn test_role_crud() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .with_txn(|txn| {
                add_role(
                    txn,
                    "reader",
                    RoleType::Vault,
                    "read only",
                    VaultPermission::Download.mask() | VaultPermission::List.mask(),
                )
            })
            .unwrap();

        let role = store
            .with_conn(|c| get_role_by_name(c, "reader"))
            .unwrap()
            .unwrap();
        assert_eq!(role.id, id);
        assert!(role.has_bit(VaultPermission::Download.bit()));

        store
            .with_txn(|txn| {
                let mut r = get_role(txn, id)?.unwrap();
                r.permissions |= VaultPermission::Create.mask();
                update_role(txn, &r)
            })
            .unwrap();

        assert!(store.with_conn(|c| role_exists(c, "reader")).unwrap());
        store.with_txn(|txn| delete_role(txn, id)).unwrap();
        assert!(!store.with_conn(|c| role_exists(c, "reader")).unwrap());
    }

    #[test]
    fn test_assignment_join() {
        let store = Store::open_in_memory().unwrap();
        let subject = Subject {
            subject_type: SubjectType::User,
            subject_id: 42,
        };
        store
            .with_txn(|txn| {
                let role = add_role(txn, "writer", RoleType::Vault, "", 0b1100)?;
                assign_vault_role(txn, 7, subject, role)?;
                Ok(())
            })
            .unwrap();

        let roles = store
            .with_conn(|c| vault_roles_for_subject(c, 7, subject))
            .unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].permissions, 0b1100);

        // Different vault: no roles.
        let roles = store
            .with_conn(|c| vault_roles_for_subject(c, 8, subject))
            .unwrap();
        assert!(roles.is_empty());
    }

    #[test]
    fn test_override_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let subject = Subject {
            subject_type: SubjectType::Group,
            subject_id: 3,
        };
        let ov = PermissionOverride {
            id: 0,
            vault_id: 1,
            subject,
            bit_position: VaultPermission::Download.bit(),
            effect: OverrideEffect::Deny,
            path_pattern: Some("/private/.*".into()),
        };
        let id = store.with_txn(|txn| add_override(txn, &ov)).unwrap();

        let got = store
            .with_conn(|c| overrides_for_subject(c, 1, subject))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, id);
        assert_eq!(got[0].effect, OverrideEffect::Deny);
        assert_eq!(got[0].path_pattern.as_deref(), Some("/private/.*"));
    }
}
