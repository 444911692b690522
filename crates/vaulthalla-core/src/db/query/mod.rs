//! The single query surface over the metadata store.
//!
//! Free functions grouped by table family; each takes a borrowed
//! connection so callers compose several queries inside one transaction.
//! Hot statements are listed in [`WARM_STATEMENTS`] and prepared per
//! connection when the pool comes up.

pub mod cache;
pub mod entry;
pub mod identity;
pub mod rbac;
pub mod vault;

/// Statements prepared at pool warm-up.
pub const WARM_STATEMENTS: &[&str] = &[
    entry::SQL_GET_BY_PATH,
    entry::SQL_GET_BY_ID,
    entry::SQL_GET_BY_INODE,
    entry::SQL_CHILDREN,
    entry::SQL_CHILD_BY_NAME,
    entry::SQL_APPLY_STATS,
    entry::SQL_PARENT_ID,
    cache::SQL_GET_BY_PATH,
    cache::SQL_TOUCH,
    rbac::SQL_VAULT_ROLES_FOR_SUBJECT,
    rbac::SQL_OVERRIDES_FOR_SUBJECT,
];
