//! Error taxonomy shared by every Vaulthalla subsystem.
//!
//! All fallible operations in the core bottom out in [`VaultError`]. The
//! FUSE adapter maps each variant onto a POSIX errno; the sync controller
//! keys its retry policy off [`VaultError::is_transient`].

use std::io;
use thiserror::Error;

/// The core error taxonomy.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No such inode, path, role, or other addressed object.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision under a parent directory.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The permission resolver returned deny.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed path, bad option, out-of-range bit position, malformed regex.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write would exceed the vault quota.
    #[error("quota exceeded: vault {vault_id} would grow past {quota_bytes} bytes")]
    QuotaExceeded { vault_id: i64, quota_bytes: u64 },

    /// Backing-store failure, local disk or non-retryable remote error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Network timeout, 5xx from the remote, lock contention beyond the cap.
    #[error("transient failure: {0}")]
    Transient(String),

    /// AEAD tag mismatch or content-hash mismatch after download.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// SigV4 rejection, metadata store unavailable at startup.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl VaultError {
    /// Whether the sync controller should retry the failed action.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Transient(_))
    }

    /// Whether the failure should halt the owning subsystem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VaultError::Fatal(_))
    }
}

impl From<io::Error> for VaultError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => VaultError::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => VaultError::AlreadyExists(e.to_string()),
            io::ErrorKind::PermissionDenied => VaultError::PermissionDenied(e.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                VaultError::Transient(e.to_string())
            }
            _ => VaultError::Io(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                VaultError::NotFound("query returned no rows".into())
            }
            rusqlite::Error::SqliteFailure(code, msg) => {
                use rusqlite::ErrorCode;
                match code.code {
                    ErrorCode::ConstraintViolation => VaultError::AlreadyExists(
                        msg.unwrap_or_else(|| "constraint violation".into()),
                    ),
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        VaultError::Transient(msg.unwrap_or_else(|| "database busy".into()))
                    }
                    _ => VaultError::Io(format!("sqlite failure: {code:?} {msg:?}")),
                }
            }
            other => VaultError::Io(other.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for VaultError {
    fn from(e: serde_yaml::Error) -> Self {
        VaultError::InvalidArgument(format!("config parse error: {e}"))
    }
}

impl From<regex::Error> for VaultError {
    fn from(e: regex::Error) -> Self {
        VaultError::InvalidArgument(format!("malformed path pattern: {e}"))
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds_map_to_taxonomy() {
        let e: VaultError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, VaultError::NotFound(_)));

        let e: VaultError = io::Error::new(io::ErrorKind::AlreadyExists, "dup").into();
        assert!(matches!(e, VaultError::AlreadyExists(_)));

        let e: VaultError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(e.is_transient());

        let e: VaultError = io::Error::other("disk fell off").into();
        assert!(matches!(e, VaultError::Io(_)));
    }

    #[test]
    fn test_no_rows_is_not_found() {
        let e: VaultError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, VaultError::NotFound(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(VaultError::Fatal("sig rejected".into()).is_fatal());
        assert!(!VaultError::Transient("timeout".into()).is_fatal());
    }
}
