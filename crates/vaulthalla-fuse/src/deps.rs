//! The immutable runtime dependency handle.
//!
//! Built exactly once after every manager is constructed; components
//! borrow it read-only from then on. There is no mutable process-wide
//! state after startup.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use vaulthalla_core::config::Config;
use vaulthalla_core::pool::PoolManager;
use vaulthalla_core::rbac::AuthManager;
use vaulthalla_core::storage::StorageManager;
use vaulthalla_core::sync::SyncController;
use vaulthalla_core::{Result, Store, VaultError};

/// Everything the adapter and outer surfaces need, wired once.
pub struct Deps {
    pub config: Config,
    pub store: Store,
    pub storage: Arc<StorageManager>,
    pub auth: Arc<AuthManager>,
    pub sync: Arc<SyncController>,
    pub pools: Arc<PoolManager>,
}

static DEPS: OnceCell<Deps> = OnceCell::new();

impl Deps {
    /// Install the handle. Fails if called twice.
    pub fn install(deps: Deps) -> Result<&'static Deps> {
        DEPS.set(deps)
            .map_err(|_| VaultError::Fatal("Deps already initialized".into()))?;
        Ok(Self::get())
    }

    /// The installed handle; panics before [`Deps::install`], which is a
    /// startup-order bug, not a runtime condition.
    pub fn get() -> &'static Deps {
        DEPS.get().expect("Deps::install must run before Deps::get")
    }

    pub fn is_installed() -> bool {
        DEPS.get().is_some()
    }
}
