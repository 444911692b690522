//! Roles, assignments, and permission overrides.
//!
//! Permission bits are identified by position inside a `u16` bitmask. The
//! two enumerations below are fixed: admin actions occupy positions 0..=9,
//! vault actions 0..=13. Bit positions are part of the persisted format
//! and must never be reordered.

use crate::error::{Result, VaultError};

/// Daemon-wide administrative permissions, bit positions 0..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminPermission {
    ManageEncryptionKeys = 0,
    ManageAdmins = 1,
    ManageUsers = 2,
    ManageGroups = 3,
    ManageRoles = 4,
    ManageSettings = 5,
    ManageVaults = 6,
    ManageApiKeys = 7,
    AuditLogAccess = 8,
    CreateVaults = 9,
}

/// Per-vault permissions, bit positions 0..=13.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VaultPermission {
    ManageVault = 0,
    ManageAccess = 1,
    ManageTags = 2,
    ManageMetadata = 3,
    ManageVersions = 4,
    ManageFileLocks = 5,
    Share = 6,
    Sync = 7,
    Create = 8,
    Download = 9,
    Delete = 10,
    Rename = 11,
    Move = 12,
    List = 13,
}

impl AdminPermission {
    pub const COUNT: u8 = 10;

    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn mask(self) -> u16 {
        1 << self.bit()
    }

    pub fn name(self) -> &'static str {
        match self {
            AdminPermission::ManageEncryptionKeys => "manage-encryption-keys",
            AdminPermission::ManageAdmins => "manage-admins",
            AdminPermission::ManageUsers => "manage-users",
            AdminPermission::ManageGroups => "manage-groups",
            AdminPermission::ManageRoles => "manage-roles",
            AdminPermission::ManageSettings => "manage-settings",
            AdminPermission::ManageVaults => "manage-vaults",
            AdminPermission::ManageApiKeys => "manage-api-keys",
            AdminPermission::AuditLogAccess => "audit-log-access",
            AdminPermission::CreateVaults => "create-vaults",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "manage-encryption-keys" => AdminPermission::ManageEncryptionKeys,
            "manage-admins" => AdminPermission::ManageAdmins,
            "manage-users" => AdminPermission::ManageUsers,
            "manage-groups" => AdminPermission::ManageGroups,
            "manage-roles" => AdminPermission::ManageRoles,
            "manage-settings" => AdminPermission::ManageSettings,
            "manage-vaults" => AdminPermission::ManageVaults,
            "manage-api-keys" => AdminPermission::ManageApiKeys,
            "audit-log-access" => AdminPermission::AuditLogAccess,
            "create-vaults" => AdminPermission::CreateVaults,
            _ => return None,
        })
    }
}

impl VaultPermission {
    pub const COUNT: u8 = 14;

    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn mask(self) -> u16 {
        1 << self.bit()
    }

    pub fn from_bit(bit: u8) -> Result<Self> {
        Ok(match bit {
            0 => VaultPermission::ManageVault,
            1 => VaultPermission::ManageAccess,
            2 => VaultPermission::ManageTags,
            3 => VaultPermission::ManageMetadata,
            4 => VaultPermission::ManageVersions,
            5 => VaultPermission::ManageFileLocks,
            6 => VaultPermission::Share,
            7 => VaultPermission::Sync,
            8 => VaultPermission::Create,
            9 => VaultPermission::Download,
            10 => VaultPermission::Delete,
            11 => VaultPermission::Rename,
            12 => VaultPermission::Move,
            13 => VaultPermission::List,
            other => {
                return Err(VaultError::InvalidArgument(format!(
                    "vault permission bit out of range: {other}"
                )));
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            VaultPermission::ManageVault => "manage-vault",
            VaultPermission::ManageAccess => "manage-access",
            VaultPermission::ManageTags => "manage-tags",
            VaultPermission::ManageMetadata => "manage-metadata",
            VaultPermission::ManageVersions => "manage-versions",
            VaultPermission::ManageFileLocks => "manage-file-locks",
            VaultPermission::Share => "share",
            VaultPermission::Sync => "sync",
            VaultPermission::Create => "create",
            VaultPermission::Download => "download",
            VaultPermission::Delete => "delete",
            VaultPermission::Rename => "rename",
            VaultPermission::Move => "move",
            VaultPermission::List => "list",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        (0..Self::COUNT)
            .filter_map(|b| Self::from_bit(b).ok())
            .find(|p| p.name() == name)
    }
}

/// Whether a role grants admin or vault permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleType {
    User,
    Vault,
}

impl RoleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleType::User => "user",
            RoleType::Vault => "vault",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(RoleType::User),
            "vault" => Ok(RoleType::Vault),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown role type: {other}"
            ))),
        }
    }
}

/// A named permission bitmask.
#[derive(Debug, Clone)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub role_type: RoleType,
    pub description: String,
    pub permissions: u16,
}

impl Role {
    pub fn has_bit(&self, bit: u8) -> bool {
        self.permissions & (1 << bit) != 0
    }
}

/// Subject of a vault-role assignment or an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
    User,
    Group,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(SubjectType::User),
            "group" => Ok(SubjectType::Group),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown subject type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub subject_id: i64,
}

/// Grants a role to a user or group within one vault.
#[derive(Debug, Clone)]
pub struct VaultRoleAssignment {
    pub id: i64,
    pub vault_id: i64,
    pub subject: Subject,
    pub role_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideEffect {
    Allow,
    Deny,
}

impl OverrideEffect {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideEffect::Allow => "allow",
            OverrideEffect::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(OverrideEffect::Allow),
            "deny" => Ok(OverrideEffect::Deny),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown override effect: {other}"
            ))),
        }
    }
}

/// A targeted adjustment of a single permission bit, optionally scoped to
/// paths matching a full-match regex.
#[derive(Debug, Clone)]
pub struct PermissionOverride {
    pub id: i64,
    pub vault_id: i64,
    pub subject: Subject,
    pub bit_position: u8,
    pub effect: OverrideEffect,
    /// `None` applies vault-wide.
    pub path_pattern: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_permission_bits_are_stable() {
        assert_eq!(VaultPermission::ManageVault.bit(), 0);
        assert_eq!(VaultPermission::Sync.bit(), 7);
        assert_eq!(VaultPermission::Create.bit(), 8);
        assert_eq!(VaultPermission::Download.bit(), 9);
        assert_eq!(VaultPermission::List.bit(), 13);
    }

    #[test]
    fn test_admin_permission_bits_are_stable() {
        assert_eq!(AdminPermission::ManageEncryptionKeys.bit(), 0);
        assert_eq!(AdminPermission::CreateVaults.bit(), 9);
    }

    #[test]
    fn test_name_round_trip() {
        for b in 0..VaultPermission::COUNT {
            let p = VaultPermission::from_bit(b).unwrap();
            assert_eq!(VaultPermission::from_name(p.name()), Some(p));
        }
        assert_eq!(
            AdminPermission::from_name("audit-log-access"),
            Some(AdminPermission::AuditLogAccess)
        );
        assert!(VaultPermission::from_name("no-such-perm").is_none());
    }

    #[test]
    fn test_from_bit_out_of_range() {
        assert!(VaultPermission::from_bit(14).is_err());
    }

    #[test]
    fn test_role_has_bit() {
        let role = Role {
            id: 1,
            name: "reader".into(),
            role_type: RoleType::Vault,
            description: String::new(),
            permissions: VaultPermission::Download.mask() | VaultPermission::List.mask(),
        };
        assert!(role.has_bit(VaultPermission::Download.bit()));
        assert!(!role.has_bit(VaultPermission::Delete.bit()));
    }
}
