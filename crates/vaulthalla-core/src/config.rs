//! Daemon configuration, read once at startup from a single YAML file.
//!
//! Every section is optional; defaults match the constants the rest of the
//! core is tuned for (pool sizes, multipart thresholds, timeouts). Unknown
//! fields are rejected so typos fail loudly at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VaultError};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the SQLite metadata store.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Number of pooled connections.
    #[serde(default = "default_db_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root under which vault FUSE mounts appear.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Root of the opaque base32-named ciphertext tree.
    #[serde(default = "default_backing_root")]
    pub backing_root: PathBuf,
    /// Root of the materialized plaintext cache (and thumbnails).
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Upper bound for the local cache before LRU eviction kicks in.
    #[serde(default = "default_cache_limit")]
    pub cache_limit_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Directory for the daemon log file; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Filter directive, e.g. `info` or `vaulthalla_core=debug`.
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachingConfig {
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThumbnailConfig {
    /// Square pixel sizes rendered per file.
    #[serde(default = "default_thumbnail_sizes")]
    pub sizes: Vec<u32>,
}

/// Worker-count overrides for the named pools plus the reserve factor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_fuse_workers")]
    pub fuse: usize,
    #[serde(default = "default_http_workers")]
    pub http: usize,
    #[serde(default = "default_thumb_workers")]
    pub thumb: usize,
    #[serde(default = "default_sync_workers")]
    pub sync: usize,
    /// Total worker handles = max(hw_concurrency * reserve_factor, 12).
    #[serde(default = "default_reserve_factor")]
    pub reserve_factor: usize,
    /// Queue depth per worker before the monitor scales a pool up.
    #[serde(default = "default_high_pressure")]
    pub high_pressure: usize,
    /// Queue depth per worker below which a pool donates back to reserve.
    #[serde(default = "default_low_pressure")]
    pub low_pressure: usize,
    /// Bounded wait when stopping a pool, in milliseconds.
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub defaults: SyncDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncDefaults {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: String,
    #[serde(default = "default_sync_strategy")]
    pub strategy: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    /// Wall-clock timeout per non-multipart request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Wall-clock timeout per uploaded part.
    #[serde(default = "default_part_timeout")]
    pub part_timeout_secs: u64,
    /// Files above this size go through multipart upload.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    /// Multipart part size.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Hex-encoded 32-byte daemon master key; per-vault keys derive from it.
    pub master_key: Option<String>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            VaultError::InvalidArgument(format!("cannot read config {}: {e}", path.display()))
        })?;
        let cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if let Some(key) = &self.vault.master_key {
            let bytes = hex::decode(key).map_err(|e| {
                VaultError::InvalidArgument(format!("vault.master_key is not hex: {e}"))
            })?;
            if bytes.len() != 32 {
                return Err(VaultError::InvalidArgument(format!(
                    "vault.master_key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        if self.pools.low_pressure >= self.pools.high_pressure {
            return Err(VaultError::InvalidArgument(
                "pools.low_pressure must be below pools.high_pressure".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.pools.graceful_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.s3.request_timeout_secs)
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.s3.part_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_db_pool_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            backing_root: default_backing_root(),
            cache_root: default_cache_root(),
            cache_limit_bytes: default_cache_limit(),
        }
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            thumbnails: ThumbnailConfig::default(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            sizes: default_thumbnail_sizes(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fuse: default_fuse_workers(),
            http: default_http_workers(),
            thumb: default_thumb_workers(),
            sync: default_sync_workers(),
            reserve_factor: default_reserve_factor(),
            high_pressure: default_high_pressure(),
            low_pressure: default_low_pressure(),
            graceful_timeout_ms: default_graceful_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            defaults: SyncDefaults::default(),
        }
    }
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            conflict_policy: default_conflict_policy(),
            strategy: default_sync_strategy(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            part_timeout_secs: default_part_timeout(),
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vaulthalla/metadata.db")
}
fn default_db_pool_size() -> usize {
    8
}
fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/vaulthalla")
}
fn default_backing_root() -> PathBuf {
    PathBuf::from("/var/lib/vaulthalla/backing")
}
fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/cache/vaulthalla")
}
fn default_cache_limit() -> u64 {
    4 * 1024 * 1024 * 1024
}
fn default_thumbnail_sizes() -> Vec<u32> {
    vec![128, 512]
}
fn default_fuse_workers() -> usize {
    4
}
fn default_http_workers() -> usize {
    3
}
fn default_thumb_workers() -> usize {
    2
}
fn default_sync_workers() -> usize {
    3
}
fn default_reserve_factor() -> usize {
    3
}
fn default_high_pressure() -> usize {
    4
}
fn default_low_pressure() -> usize {
    1
}
fn default_graceful_timeout_ms() -> u64 {
    1200
}
fn default_sync_interval() -> u64 {
    60
}
fn default_conflict_policy() -> String {
    "keep_local".into()
}
fn default_sync_strategy() -> String {
    "sync".into()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_part_timeout() -> u64 {
    300
}
fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024
}
fn default_part_size() -> u64 {
    5 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.pools.fuse, 4);
        assert_eq!(cfg.pools.http, 3);
        assert_eq!(cfg.pools.thumb, 2);
        assert_eq!(cfg.pools.sync, 3);
        assert_eq!(cfg.s3.multipart_threshold, 8 * 1024 * 1024);
        assert_eq!(cfg.s3.part_size, 5 * 1024 * 1024);
        assert_eq!(cfg.pools.graceful_timeout_ms, 1200);
        assert_eq!(cfg.caching.thumbnails.sizes, vec![128, 512]);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let res: std::result::Result<Config, _> = serde_yaml::from_str("bogus_section: 1");
        assert!(res.is_err());
    }

    #[test]
    fn test_pool_overrides() {
        let cfg: Config = serde_yaml::from_str(
            "pools:\n  fuse: 8\n  reserve_factor: 2\n",
        )
        .unwrap();
        assert_eq!(cfg.pools.fuse, 8);
        assert_eq!(cfg.pools.reserve_factor, 2);
        assert_eq!(cfg.pools.http, 3);
    }

    #[test]
    fn test_master_key_validation() {
        let cfg: Config = serde_yaml::from_str(&format!(
            "vault:\n  master_key: \"{}\"\n",
            "ab".repeat(32)
        ))
        .unwrap();
        assert!(cfg.validate().is_ok());

        let cfg: Config =
            serde_yaml::from_str("vault:\n  master_key: \"abcd\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
