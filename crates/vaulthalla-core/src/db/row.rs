//! Row decoding, decoupled from the relational client.
//!
//! Query code never touches `rusqlite::Row` directly: it goes through
//! [`RowView`], a provider of typed columns by name, and [`FromRow`]
//! decoders on the model types. Swapping the client means implementing
//! `RowView` once.

use std::path::PathBuf;

use crate::error::{Result, VaultError};
use crate::model::{
    ApiKey, CacheKind, CacheRecord, ConflictPolicy, DirStats, EntryKind, FSEntry, Group,
    OverrideEffect, PermissionOverride, Role, RoleType, Subject, SubjectType, SyncPolicy,
    SyncStrategy, TrashedFile, User, Vault, VaultRoleAssignment, VaultType,
};

/// A row provider yielding typed columns by name.
pub trait RowView {
    fn i64(&self, col: &str) -> Result<i64>;
    fn opt_i64(&self, col: &str) -> Result<Option<i64>>;
    fn text(&self, col: &str) -> Result<String>;
    fn opt_text(&self, col: &str) -> Result<Option<String>>;
    fn flag(&self, col: &str) -> Result<bool>;

    fn u64(&self, col: &str) -> Result<u64> {
        let v = self.i64(col)?;
        u64::try_from(v)
            .map_err(|_| VaultError::InvalidArgument(format!("column {col} is negative: {v}")))
    }

    fn u32(&self, col: &str) -> Result<u32> {
        let v = self.i64(col)?;
        u32::try_from(v)
            .map_err(|_| VaultError::InvalidArgument(format!("column {col} out of range: {v}")))
    }

    fn u16(&self, col: &str) -> Result<u16> {
        let v = self.i64(col)?;
        u16::try_from(v)
            .map_err(|_| VaultError::InvalidArgument(format!("column {col} out of range: {v}")))
    }

    fn u8(&self, col: &str) -> Result<u8> {
        let v = self.i64(col)?;
        u8::try_from(v)
            .map_err(|_| VaultError::InvalidArgument(format!("column {col} out of range: {v}")))
    }
}

impl RowView for rusqlite::Row<'_> {
    fn i64(&self, col: &str) -> Result<i64> {
        self.get::<_, i64>(col).map_err(Into::into)
    }

    fn opt_i64(&self, col: &str) -> Result<Option<i64>> {
        self.get::<_, Option<i64>>(col).map_err(Into::into)
    }

    fn text(&self, col: &str) -> Result<String> {
        self.get::<_, String>(col).map_err(Into::into)
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>> {
        self.get::<_, Option<String>>(col).map_err(Into::into)
    }

    fn flag(&self, col: &str) -> Result<bool> {
        self.get::<_, bool>(col).map_err(Into::into)
    }
}

/// Decode `Self` from a row.
pub trait FromRow: Sized {
    fn from_row(row: &dyn RowView) -> Result<Self>;
}

impl FromRow for FSEntry {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(FSEntry {
            id: row.i64("id")?,
            inode: row.u64("inode")?,
            parent_id: row.opt_i64("parent_id")?,
            vault_id: row.i64("vault_id")?,
            name: row.text("name")?,
            base32_alias: row.text("base32_alias")?,
            path: row.text("path")?,
            kind: if row.flag("is_dir")? {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            mode: row.u32("mode")?,
            owner_uid: row.u32("owner_uid")?,
            group_gid: row.u32("group_gid")?,
            is_hidden: row.flag("is_hidden")?,
            is_system: row.flag("is_system")?,
            size_bytes: row.u64("size_bytes")?,
            mime_type: row.opt_text("mime_type")?,
            content_hash: row.opt_text("content_hash")?,
            encryption_iv: row.opt_text("encryption_iv")?,
            key_version: row.i64("key_version")?,
            created_at: row.i64("created_at")?,
            updated_at: row.i64("updated_at")?,
        })
    }
}

impl FromRow for DirStats {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(DirStats {
            dir_id: row.i64("dir_id")?,
            size_bytes: row.i64("size_bytes")?,
            file_count: row.i64("file_count")?,
            subdirectory_count: row.i64("subdirectory_count")?,
        })
    }
}

impl FromRow for TrashedFile {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(TrashedFile {
            id: row.i64("id")?,
            vault_id: row.i64("vault_id")?,
            name: row.text("name")?,
            path: row.text("path")?,
            backing_path: PathBuf::from(row.text("backing_path")?),
            size_bytes: row.u64("size_bytes")?,
            deleted_by: row.i64("deleted_by")?,
            trashed_at: row.i64("trashed_at")?,
            purged: row.flag("purged")?,
        })
    }
}

impl FromRow for CacheRecord {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        let kind_raw = row.text("kind")?;
        Ok(CacheRecord {
            id: row.i64("id")?,
            vault_id: row.i64("vault_id")?,
            file_id: row.i64("file_id")?,
            path: PathBuf::from(row.text("path")?),
            kind: CacheKind::parse(&kind_raw).ok_or_else(|| {
                VaultError::InvalidArgument(format!("unknown cache kind: {kind_raw}"))
            })?,
            size: row.u64("size")?,
            last_accessed: row.i64("last_accessed")?,
            created_at: row.i64("created_at")?,
        })
    }
}

impl FromRow for Role {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(Role {
            id: row.i64("id")?,
            name: row.text("name")?,
            role_type: RoleType::parse(&row.text("role_type")?)?,
            description: row.text("description")?,
            permissions: row.u16("permissions")?,
        })
    }
}

impl FromRow for VaultRoleAssignment {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(VaultRoleAssignment {
            id: row.i64("id")?,
            vault_id: row.i64("vault_id")?,
            subject: Subject {
                subject_type: SubjectType::parse(&row.text("subject_type")?)?,
                subject_id: row.i64("subject_id")?,
            },
            role_id: row.i64("role_id")?,
        })
    }
}

impl FromRow for PermissionOverride {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(PermissionOverride {
            id: row.i64("id")?,
            vault_id: row.i64("vault_id")?,
            subject: Subject {
                subject_type: SubjectType::parse(&row.text("subject_type")?)?,
                subject_id: row.i64("subject_id")?,
            },
            bit_position: row.u8("bit_position")?,
            effect: OverrideEffect::parse(&row.text("effect")?)?,
            path_pattern: row.opt_text("path_pattern")?,
        })
    }
}

impl FromRow for User {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(User {
            id: row.i64("id")?,
            name: row.text("name")?,
            uid: row.u32("uid")?,
            admin_role_id: row.opt_i64("admin_role_id")?,
            created_at: row.i64("created_at")?,
        })
    }
}

impl FromRow for Group {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(Group {
            id: row.i64("id")?,
            name: row.text("name")?,
            gid: row.u32("gid")?,
            created_at: row.i64("created_at")?,
        })
    }
}

impl FromRow for ApiKey {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(ApiKey {
            id: row.i64("id")?,
            user_id: row.i64("user_id")?,
            name: row.text("name")?,
            access_key: row.text("access_key")?,
            secret_access_key: row.text("secret_access_key")?,
            region: row.text("region")?,
            endpoint: row.text("endpoint")?,
            provider: row.text("provider")?,
        })
    }
}

impl FromRow for Vault {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(Vault {
            id: row.i64("id")?,
            name: row.text("name")?,
            owner_id: row.i64("owner_id")?,
            description: row.text("description")?,
            quota_bytes: row.u64("quota_bytes")?,
            vault_type: VaultType::parse(&row.text("vault_type")?)?,
            mount_path: row.text("mount_path")?,
            key_version: row.i64("key_version")?,
        })
    }
}

impl FromRow for SyncPolicy {
    fn from_row(row: &dyn RowView) -> Result<Self> {
        Ok(SyncPolicy {
            vault_id: row.i64("vault_id")?,
            interval: std::time::Duration::from_secs(row.u64("interval_secs")?),
            conflict_policy: ConflictPolicy::parse(&row.text("conflict_policy")?)?,
            strategy: SyncStrategy::parse(&row.text("strategy")?)?,
        })
    }
}
