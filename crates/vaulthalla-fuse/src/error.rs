//! Mapping the core error taxonomy onto POSIX errnos.

use vaulthalla_core::VaultError;

/// The errno a FUSE reply should carry for a core error.
pub fn errno_for(e: &VaultError) -> i32 {
    match e {
        VaultError::NotFound(_) => libc::ENOENT,
        VaultError::AlreadyExists(_) => libc::EEXIST,
        VaultError::PermissionDenied(_) => libc::EACCES,
        VaultError::InvalidArgument(_) => libc::EINVAL,
        VaultError::QuotaExceeded { .. } => libc::EDQUOT,
        VaultError::Io(_) | VaultError::Integrity(_) | VaultError::Fatal(_) => libc::EIO,
        VaultError::Transient(_) => libc::EAGAIN,
    }
}
