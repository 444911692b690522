//! Role-based access control.
//!
//! [`resolver`] holds the pure bit-composition algorithm;
//! [`AuthManager`] feeds it from the metadata store per request.

pub mod resolver;

pub use resolver::{resolve_vault_bit, Action, OverrideScope};

use crate::db::{query, Store};
use crate::error::{Result, VaultError};
use crate::model::{Subject, SubjectType, User};

/// Store-backed authorization facade. Stateless per call; deterministic
/// for a given store snapshot.
pub struct AuthManager {
    store: Store,
}

impl AuthManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve the daemon user bound to a POSIX uid.
    pub fn user_by_uid(&self, uid: u32) -> Result<Option<User>> {
        self.store.with_conn(|conn| query::identity::get_user_by_uid(conn, uid))
    }

    /// Answer `(subject, action, vault, path)` with allow/deny.
    pub fn check(
        &self,
        user: &User,
        action: Action,
        vault_id: i64,
        path: &str,
    ) -> Result<bool> {
        match action {
            Action::Admin(perm) => self.store.with_conn(|conn| {
                // Overrides never apply to admin actions.
                let Some(role_id) = user.admin_role_id else {
                    return Ok(false);
                };
                let role = query::rbac::get_role(conn, role_id)?
                    .ok_or_else(|| VaultError::NotFound(format!("admin role {role_id}")))?;
                Ok(role.has_bit(perm.bit()))
            }),
            Action::Vault(perm) => self.store.with_conn(|conn| {
                let user_subject = Subject {
                    subject_type: SubjectType::User,
                    subject_id: user.id,
                };
                let groups = query::identity::groups_of_user(conn, user.id)?;

                let mut base: u16 = 0;
                for role in query::rbac::vault_roles_for_subject(conn, vault_id, user_subject)? {
                    base |= role.permissions;
                }

                let mut overrides = Vec::new();
                for ov in query::rbac::overrides_for_subject(conn, vault_id, user_subject)? {
                    overrides.push((OverrideScope::User, ov));
                }
                for gid in groups {
                    let subject = Subject {
                        subject_type: SubjectType::Group,
                        subject_id: gid,
                    };
                    for role in query::rbac::vault_roles_for_subject(conn, vault_id, subject)? {
                        base |= role.permissions;
                    }
                    for ov in query::rbac::overrides_for_subject(conn, vault_id, subject)? {
                        overrides.push((OverrideScope::Group, ov));
                    }
                }

                resolve_vault_bit(base, perm.bit(), &overrides, path)
            }),
        }
    }

    /// [`AuthManager::check`], turning a deny into [`VaultError::PermissionDenied`].
    pub fn authorize(
        &self,
        user: &User,
        action: Action,
        vault_id: i64,
        path: &str,
    ) -> Result<()> {
        if self.check(user, action, vault_id, path)? {
            Ok(())
        } else {
            Err(VaultError::PermissionDenied(format!(
                "user {} denied {:?} on vault {} path {}",
                user.name, action, vault_id, path
            )))
        }
    }
}
