//! Typed data model shared by the store, engine, and resolver.

pub mod cache;
pub mod entry;
pub mod identity;
pub mod rbac;
pub mod vault;

pub use cache::{CacheKind, CacheRecord};
pub use entry::{DirStats, EntryKind, FSEntry, TrashedFile};
pub use identity::{ApiKey, Group, User};
pub use rbac::{
    AdminPermission, OverrideEffect, PermissionOverride, Role, RoleType, Subject, SubjectType,
    VaultPermission, VaultRoleAssignment,
};
pub use vault::{ConflictPolicy, SyncPolicy, SyncStrategy, Vault, VaultType};
