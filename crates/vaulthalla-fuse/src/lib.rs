//! FUSE adapter for Vaulthalla vaults.
//!
//! Exposes each registered vault as a POSIX filesystem backed by the
//! core storage engine, with authorization at the filesystem layer. The
//! `vaulthalla` binary wires configuration, the metadata store, the pool
//! manager, and the sync controller together and mounts every vault.

pub mod attr;
pub mod deps;
pub mod error;
pub mod filesystem;

pub use deps::Deps;
pub use error::errno_for;
pub use filesystem::VaultFilesystem;
