//! Vaults and their synchronization policies.

use std::time::Duration;

use crate::error::{Result, VaultError};

/// Where a vault's objects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultType {
    /// Backing tree on local disk only; no remote reconciliation.
    Local,
    /// S3-compatible object storage behind the backing tree.
    S3,
}

impl VaultType {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultType::Local => "local",
            VaultType::S3 => "s3",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(VaultType::Local),
            "s3" => Ok(VaultType::S3),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown vault type: {other}"
            ))),
        }
    }
}

/// A user-defined vault exposed under the mount root.
#[derive(Debug, Clone)]
pub struct Vault {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub description: String,
    /// 0 means unlimited.
    pub quota_bytes: u64,
    pub vault_type: VaultType,
    pub mount_path: String,
    /// Current encryption key version; newly written blobs use it.
    pub key_version: i64,
}

impl Vault {
    /// Remote key-space prefix for this vault's objects.
    pub fn remote_prefix(&self) -> String {
        format!("vault-{}/", self.id)
    }
}

/// What to do when local and remote content diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    KeepLocal,
    KeepRemote,
    Overwrite,
    /// Surface an event for an external collaborator; take no action.
    Ask,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::KeepLocal => "keep_local",
            ConflictPolicy::KeepRemote => "keep_remote",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Ask => "ask",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "keep_local" => Ok(ConflictPolicy::KeepLocal),
            "keep_remote" => Ok(ConflictPolicy::KeepRemote),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "ask" => Ok(ConflictPolicy::Ask),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown conflict policy: {other}"
            ))),
        }
    }
}

/// How aggressively remote state is mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Fetch on demand, keep blobs only while cached.
    Cache,
    /// Two-way reconciliation of known entries.
    Sync,
    /// Full local replica of the remote key space.
    Mirror,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStrategy::Cache => "cache",
            SyncStrategy::Sync => "sync",
            SyncStrategy::Mirror => "mirror",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cache" => Ok(SyncStrategy::Cache),
            "sync" => Ok(SyncStrategy::Sync),
            "mirror" => Ok(SyncStrategy::Mirror),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown sync strategy: {other}"
            ))),
        }
    }

    /// Whether remote-only keys should be pulled down.
    pub fn pulls_remote(self) -> bool {
        matches!(self, SyncStrategy::Sync | SyncStrategy::Mirror)
    }
}

/// Per-vault reconciliation policy.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub vault_id: i64,
    pub interval: Duration,
    pub conflict_policy: ConflictPolicy,
    pub strategy: SyncStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            ConflictPolicy::parse("keep_local").unwrap(),
            ConflictPolicy::KeepLocal
        );
        assert_eq!(SyncStrategy::parse("mirror").unwrap(), SyncStrategy::Mirror);
        assert!(ConflictPolicy::parse("flip_coin").is_err());
    }

    #[test]
    fn test_strategy_pulls_remote() {
        assert!(SyncStrategy::Mirror.pulls_remote());
        assert!(SyncStrategy::Sync.pulls_remote());
        assert!(!SyncStrategy::Cache.pulls_remote());
    }

    #[test]
    fn test_remote_prefix() {
        let v = Vault {
            id: 7,
            name: "media".into(),
            owner_id: 1,
            description: String::new(),
            quota_bytes: 0,
            vault_type: VaultType::S3,
            mount_path: "/mnt/vaulthalla/media".into(),
            key_version: 1,
        };
        assert_eq!(v.remote_prefix(), "vault-7/");
    }
}
