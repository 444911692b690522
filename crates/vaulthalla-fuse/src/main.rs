#![deny(unsafe_code)]

//! The `vaulthalla` daemon: mount every configured vault, keep the sync
//! loops running, shut down cleanly on SIGINT/SIGTERM.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vaulthalla_core::config::Config;
use vaulthalla_core::crypto::KeyRing;
use vaulthalla_core::db::{query, Store};
use vaulthalla_core::model::{Vault, VaultType};
use vaulthalla_core::pool::PoolManager;
use vaulthalla_core::rbac::AuthManager;
use vaulthalla_core::storage::{
    CacheStore, PassthroughCodec, PathLocks, StorageManager, VaultPaths,
};
use vaulthalla_core::sync::SyncController;

use vaulthalla_fuse::{Deps, VaultFilesystem};

/// Encrypted vault daemon: POSIX vaults over object storage
#[derive(Parser)]
#[command(name = "vaulthalla")]
#[command(author, version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "VAULTHALLA_CONFIG", default_value = "/etc/vaulthalla/config.yaml")]
    config: PathBuf,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(cli: &Cli, config: &Config) -> Result<()> {
    let default = match cli.verbose {
        0 => config.logging.level.clone().unwrap_or_else(|| "info".into()),
        1 => "debug".into(),
        _ => "trace".into(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match &config.logging.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("vaulthalla.log"))
                .context("cannot open log file")?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn build_deps(config: Config, keys: Arc<KeyRing>) -> Result<&'static Deps> {
    let store = Store::open(&config.database.path, config.database.pool_size)
        .context("opening metadata store")?;

    let paths = Arc::new(VaultPaths::new(&config.storage));
    let cache = Arc::new(CacheStore::new(
        store.clone(),
        Arc::clone(&paths),
        config.storage.cache_limit_bytes,
    ));
    let storage = Arc::new(StorageManager::new(
        store.clone(),
        Arc::clone(&keys),
        paths,
        Arc::new(PathLocks::new()),
        cache,
        Arc::new(PassthroughCodec),
        config.caching.thumbnails.sizes.clone(),
    ));
    let auth = Arc::new(AuthManager::new(store.clone()));
    let pools = PoolManager::init(&config.pools);
    let sync = Arc::new(SyncController::new(
        store.clone(),
        Arc::clone(&storage),
        Arc::clone(&pools),
        config.s3.clone(),
        config.sync.defaults.clone(),
    ));

    Deps::install(Deps {
        config,
        store,
        storage,
        auth,
        sync,
        pools,
    })
    .context("installing runtime deps")
}

/// Start the sync loop for one S3 vault using its owner's API key.
fn start_sync(deps: &Deps, vault: &Vault, keys: &KeyRing) -> Result<()> {
    let api_keys = deps
        .store
        .with_conn(|conn| query::identity::list_api_keys_for_user(conn, vault.owner_id))?;
    let Some(sealed) = api_keys.into_iter().next() else {
        warn!(vault = vault.id, "S3 vault has no API key, sync disabled");
        return Ok(());
    };

    let secret = keys
        .open_secret(&sealed.secret_access_key)
        .context("unsealing API key secret")?;
    let api_key = vaulthalla_core::model::ApiKey {
        secret_access_key: String::from_utf8(secret).context("API key secret is not UTF-8")?,
        ..sealed
    };

    let bucket = vaulthalla_core::storage::paths::snake_case(&vault.name);
    deps.sync.start_vault(vault, api_key, bucket)?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    init_tracing(&cli, &config)?;
    info!(config = %cli.config.display(), "vaulthalla starting");

    let keys = match &config.vault.master_key {
        Some(hex_key) => Arc::new(KeyRing::from_hex(hex_key).context("vault.master_key")?),
        None => {
            warn!("no vault.master_key configured; using an ephemeral key (data unreadable after restart)");
            Arc::new(KeyRing::ephemeral())
        }
    };
    let deps = build_deps(config, Arc::clone(&keys))?;

    let vaults = deps.storage.vaults()?;
    if vaults.is_empty() {
        warn!("no vaults registered; daemon will idle");
    }

    let mut sessions = Vec::new();
    for vault in &vaults {
        let engine = deps.storage.register_vault(vault)?;
        if vault.vault_type == VaultType::S3 {
            if let Err(e) = start_sync(deps, vault, &keys) {
                error!(vault = vault.id, error = %e, "sync startup failed; vault serves local-only");
            }
        }

        let mountpoint = deps
            .config
            .storage
            .mount_root
            .join(vaulthalla_core::storage::paths::snake_case(&vault.name));
        fs::create_dir_all(&mountpoint)
            .with_context(|| format!("creating mountpoint {}", mountpoint.display()))?;

        let filesystem = VaultFilesystem::new(
            engine,
            Arc::clone(&deps.auth),
            Arc::clone(&deps.storage),
            Arc::clone(&deps.pools),
        );
        let options = vec![
            fuser::MountOption::FSName(format!("vaulthalla-{}", vault.id)),
            fuser::MountOption::AutoUnmount,
        ];
        let session = fuser::spawn_mount2(filesystem, &mountpoint, &options)
            .with_context(|| format!("mounting vault {} at {}", vault.name, mountpoint.display()))?;
        info!(vault = vault.id, mountpoint = %mountpoint.display(), "vault mounted");
        sessions.push(session);
    }

    // Block until SIGINT/SIGTERM, then unwind in dependency order.
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing signal handler")?;
    let _ = shutdown_rx.recv();

    info!("shutting down");
    drop(sessions); // unmount first so no new work arrives
    deps.sync.shutdown();
    deps.pools.shutdown();
    info!("vaulthalla stopped");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("vaulthalla: {e:#}");
        std::process::exit(1);
    }
}
