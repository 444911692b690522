//! Path derivation for the three coexisting trees.
//!
//! The canonical representation everywhere in the core is the
//! vault-relative `rel_path` with a leading `/`. The FUSE-visible path and
//! the opaque backing path are derived on demand: the former from the
//! mount root and vault name, the latter from the entry's ancestor alias
//! chain. Neither is ever persisted.

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::{Result, VaultError};
use crate::model::Vault;

/// Root directories shared by every vault.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub mount_root: PathBuf,
    pub backing_root: PathBuf,
    pub cache_root: PathBuf,
}

impl VaultPaths {
    pub fn new(cfg: &StorageConfig) -> Self {
        Self {
            mount_root: cfg.mount_root.clone(),
            backing_root: cfg.backing_root.clone(),
            cache_root: cfg.cache_root.clone(),
        }
    }

    /// `<mount_root>/<vault_name_snake><rel_path>`, the user-facing view.
    pub fn fuse_path(&self, vault: &Vault, rel_path: &str) -> PathBuf {
        let mut p = self.mount_root.join(snake_case(&vault.name));
        p.push(rel_path.trim_start_matches('/'));
        p
    }

    /// `<backing_root>/<alias₁>/…/<aliasₙ>`, the ciphertext location.
    pub fn backing_path(&self, alias_chain: &[String]) -> PathBuf {
        let mut p = self.backing_root.clone();
        for alias in alias_chain {
            p.push(alias);
        }
        p
    }

    /// Materialized plaintext blob for a file alias.
    pub fn cache_file_path(&self, alias: &str) -> PathBuf {
        self.cache_root.join("files").join(alias)
    }

    /// `<cache_root>/thumbnails/<alias>/<size>.jpg`.
    pub fn thumbnail_path(&self, alias: &str, size: u32) -> PathBuf {
        self.cache_root
            .join("thumbnails")
            .join(alias)
            .join(format!("{size}.jpg"))
    }

    /// A cache-root-relative path for `cache_index.path`.
    pub fn cache_rel(&self, abs: &Path) -> Result<PathBuf> {
        abs.strip_prefix(&self.cache_root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                VaultError::InvalidArgument(format!(
                    "{} is outside the cache root",
                    abs.display()
                ))
            })
    }
}

/// Lower-snake rendering of a vault name for its mount directory.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Remote object key for a file: `vault-<id>/<alias chain>`.
pub fn remote_key(vault_id: i64, alias_chain: &[String]) -> String {
    format!("vault-{vault_id}/{}", alias_chain.join("/"))
}

/// Split a remote key back into `(vault_id, alias segments)`.
pub fn parse_remote_key(key: &str) -> Result<(i64, Vec<&str>)> {
    let rest = key
        .strip_prefix("vault-")
        .ok_or_else(|| VaultError::InvalidArgument(format!("not a vault key: {key}")))?;
    let (vault, chain) = rest
        .split_once('/')
        .ok_or_else(|| VaultError::InvalidArgument(format!("key has no object part: {key}")))?;
    let vault_id: i64 = vault
        .parse()
        .map_err(|_| VaultError::InvalidArgument(format!("bad vault id in key: {key}")))?;
    Ok((vault_id, chain.split('/').collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VaultType;

    fn paths() -> VaultPaths {
        VaultPaths {
            mount_root: PathBuf::from("/mnt/vaulthalla"),
            backing_root: PathBuf::from("/var/lib/vaulthalla/backing"),
            cache_root: PathBuf::from("/var/cache/vaulthalla"),
        }
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("My Vault"), "my_vault");
        assert_eq!(snake_case("photos"), "photos");
        assert_eq!(snake_case("A--B"), "a_b");
        assert_eq!(snake_case("Tax 2024!"), "tax_2024");
    }

    #[test]
    fn test_fuse_path() {
        let vault = Vault {
            id: 1,
            name: "My Vault".into(),
            owner_id: 1,
            description: String::new(),
            quota_bytes: 0,
            vault_type: VaultType::Local,
            mount_path: String::new(),
            key_version: 1,
        };
        assert_eq!(
            paths().fuse_path(&vault, "/a/b.txt"),
            PathBuf::from("/mnt/vaulthalla/my_vault/a/b.txt")
        );
    }

    #[test]
    fn test_backing_path_concatenates_aliases() {
        let chain = vec!["aa".to_string(), "bb".to_string(), "cc".to_string()];
        assert_eq!(
            paths().backing_path(&chain),
            PathBuf::from("/var/lib/vaulthalla/backing/aa/bb/cc")
        );
    }

    #[test]
    fn test_remote_key_round_trip() {
        let chain = vec!["aa".to_string(), "bb".to_string()];
        let key = remote_key(7, &chain);
        assert_eq!(key, "vault-7/aa/bb");

        let (vault_id, segs) = parse_remote_key(&key).unwrap();
        assert_eq!(vault_id, 7);
        assert_eq!(segs, vec!["aa", "bb"]);
    }

    #[test]
    fn test_parse_remote_key_rejects_garbage() {
        assert!(parse_remote_key("not-a-key").is_err());
        assert!(parse_remote_key("vault-x/aa").is_err());
        assert!(parse_remote_key("vault-3").is_err());
    }

    #[test]
    fn test_thumbnail_path() {
        assert_eq!(
            paths().thumbnail_path("abcd", 128),
            PathBuf::from("/var/cache/vaulthalla/thumbnails/abcd/128.jpg")
        );
    }

    #[test]
    fn test_cache_rel() {
        let p = paths();
        let rel = p
            .cache_rel(Path::new("/var/cache/vaulthalla/files/abcd"))
            .unwrap();
        assert_eq!(rel, PathBuf::from("files/abcd"));
        assert!(p.cache_rel(Path::new("/elsewhere/x")).is_err());
    }
}
