//! Vault storage: path model, locks, engines, cache, thumbnails.

pub mod cache;
pub mod engine;
pub mod lock;
pub mod manager;
pub mod paths;
pub mod thumbnail;

pub use cache::CacheStore;
pub use engine::{Engine, RemoteFetcher};
pub use lock::PathLocks;
pub use manager::StorageManager;
pub use paths::{parse_remote_key, remote_key, VaultPaths};
pub use thumbnail::{PassthroughCodec, ThumbnailCodec, ThumbnailTask};
