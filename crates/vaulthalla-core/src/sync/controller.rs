//! Per-vault synchronization loops.
//!
//! Each S3-backed vault gets a background thread cycling
//! `Idle -> Pulling -> Reconciling -> Pushing -> Idle` on its policy
//! interval. The change queue produced by the storage engine drains with
//! higher priority than pull reconciliation; remote work is dispatched
//! onto the `sync` pool. Transient failures re-enqueue with exponential
//! backoff capped at the policy interval; a signature rejection halts the
//! vault's loop and raises a fatal event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{S3Config, SyncDefaults};
use crate::db::{query, Store};
use crate::error::{Result, VaultError};
use crate::model::{ApiKey, ConflictPolicy, SyncPolicy, SyncStrategy, Vault};
use crate::pool::{PoolManager, ThreadPool};
use crate::storage::{parse_remote_key, Engine, StorageManager};
use crate::sync::client::S3Client;
use crate::sync::events::{ChangeEvent, SyncEvent};
use crate::sync::remote::RemoteObject;

/// Loop state, spec'd transitions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    Pulling,
    Reconciling,
    Pushing,
}

/// One remote object joined against the local view.
#[derive(Debug, Clone)]
pub(crate) struct RemoteState {
    pub key: String,
    pub remote_hash: Option<String>,
    /// `(entry id, local content hash)` when the alias chain resolves.
    pub local: Option<(i64, Option<String>)>,
}

/// What reconciliation decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlannedAction {
    Upload { entry_id: i64 },
    Pull { key: String },
    PullReplace { key: String, entry_id: i64 },
    AskConflict { entry_id: i64, key: String },
}

/// Pure reconciliation: join the remote listing against local entries and
/// emit actions per the conflict policy and strategy.
pub(crate) fn plan_actions(
    remote: &[RemoteState],
    locals: &[(i64, String)],
    policy: ConflictPolicy,
    strategy: SyncStrategy,
) -> Vec<PlannedAction> {
    let mut actions = Vec::new();
    let mut matched = std::collections::HashSet::new();

    for obj in remote {
        match &obj.local {
            Some((entry_id, local_hash)) => {
                matched.insert(*entry_id);
                let differs = match (&obj.remote_hash, local_hash) {
                    (Some(r), Some(l)) => r != l,
                    // Hash metadata not written yet: treat as settled.
                    _ => false,
                };
                if !differs {
                    continue;
                }
                match policy {
                    ConflictPolicy::KeepLocal | ConflictPolicy::Overwrite => {
                        actions.push(PlannedAction::Upload { entry_id: *entry_id });
                    }
                    ConflictPolicy::KeepRemote => actions.push(PlannedAction::PullReplace {
                        key: obj.key.clone(),
                        entry_id: *entry_id,
                    }),
                    ConflictPolicy::Ask => actions.push(PlannedAction::AskConflict {
                        entry_id: *entry_id,
                        key: obj.key.clone(),
                    }),
                }
            }
            None => {
                if strategy.pulls_remote() {
                    actions.push(PlannedAction::Pull {
                        key: obj.key.clone(),
                    });
                }
            }
        }
    }

    for (entry_id, _path) in locals {
        if !matched.contains(entry_id) {
            actions.push(PlannedAction::Upload { entry_id: *entry_id });
        }
    }
    actions
}

/// Supervises one sync loop per started vault.
pub struct SyncController {
    store: Store,
    storage: Arc<StorageManager>,
    pools: Arc<PoolManager>,
    s3_cfg: S3Config,
    defaults: SyncDefaults,
    loops: Mutex<HashMap<i64, LoopHandle>>,
    notify_tx: Sender<SyncEvent>,
    notify_rx: Receiver<SyncEvent>,
}

struct LoopHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyncController {
    pub fn new(
        store: Store,
        storage: Arc<StorageManager>,
        pools: Arc<PoolManager>,
        s3_cfg: S3Config,
        defaults: SyncDefaults,
    ) -> Self {
        let (notify_tx, notify_rx) = unbounded();
        Self {
            store,
            storage,
            pools,
            s3_cfg,
            defaults,
            loops: Mutex::new(HashMap::new()),
            notify_tx,
            notify_rx,
        }
    }

    /// Stream of conflict/fatal notifications for external collaborators.
    pub fn events(&self) -> Receiver<SyncEvent> {
        self.notify_rx.clone()
    }

    /// Policy from the store, falling back to the configured defaults.
    pub fn policy_for(&self, vault_id: i64) -> Result<SyncPolicy> {
        if let Some(policy) = self
            .store
            .with_conn(|conn| query::vault::get_sync_policy(conn, vault_id))?
        {
            return Ok(policy);
        }
        Ok(SyncPolicy {
            vault_id,
            interval: Duration::from_secs(self.defaults.interval_secs),
            conflict_policy: ConflictPolicy::parse(&self.defaults.conflict_policy)?,
            strategy: SyncStrategy::parse(&self.defaults.strategy)?,
        })
    }

    /// Start the reconciliation loop for an S3 vault.
    pub fn start_vault(&self, vault: &Vault, api_key: ApiKey, bucket: String) -> Result<()> {
        let mut loops = self.loops.lock();
        if loops.contains_key(&vault.id) {
            return Ok(());
        }

        let engine = self.storage.engine(vault.id)?;
        let client = Arc::new(S3Client::new(api_key, bucket, &self.s3_cfg)?);
        engine.set_fetcher(Arc::clone(&client) as Arc<dyn crate::storage::RemoteFetcher>);

        let events = self.storage.claim_events(vault.id).ok_or_else(|| {
            VaultError::Fatal(format!("change events for vault {} already claimed", vault.id))
        })?;
        let policy = self.policy_for(vault.id)?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut vault_loop = VaultLoop {
            vault_id: vault.id,
            prefix: vault.remote_prefix(),
            engine,
            store: self.store.clone(),
            client,
            policy,
            events,
            notify: self.notify_tx.clone(),
            stop: Arc::clone(&stop),
            pool: self.pools.sync_pool(),
            state: SyncState::Idle,
            retries: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("vh-sync-{}", vault.id))
            .spawn(move || vault_loop.run())
            .map_err(|e| VaultError::Fatal(format!("cannot spawn sync loop: {e}")))?;

        loops.insert(
            vault.id,
            LoopHandle {
                stop,
                thread: Some(thread),
            },
        );
        info!(vault = vault.id, "sync loop started");
        Ok(())
    }

    pub fn stop_vault(&self, vault_id: i64) {
        if let Some(mut handle) = self.loops.lock().remove(&vault_id) {
            handle.stop.store(true, Ordering::SeqCst);
            if let Some(t) = handle.thread.take() {
                let _ = t.join();
            }
            info!(vault = vault_id, "sync loop stopped");
        }
    }

    /// Stop every loop; pending mutations stay queued in the store-side
    /// state and are rebuilt from reconciliation on next start.
    pub fn shutdown(&self) {
        let ids: Vec<i64> = self.loops.lock().keys().copied().collect();
        for id in ids {
            self.stop_vault(id);
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A change action awaiting retry after a transient failure.
struct RetryItem {
    event: ChangeEvent,
    attempts: u32,
    next_due: Instant,
}

struct VaultLoop {
    vault_id: i64,
    prefix: String,
    engine: Arc<Engine>,
    store: Store,
    client: Arc<S3Client>,
    policy: SyncPolicy,
    events: Receiver<ChangeEvent>,
    notify: Sender<SyncEvent>,
    stop: Arc<AtomicBool>,
    pool: Arc<ThreadPool>,
    state: SyncState,
    retries: Vec<RetryItem>,
}

impl VaultLoop {
    fn run(&mut self) {
        // React to shutdown promptly even with long intervals.
        let tick = Duration::from_millis(500).min(self.policy.interval);
        let mut last_cycle: Option<Instant> = None;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let mut pending = Vec::new();
            match self.events.recv_timeout(tick) {
                Ok(event) => {
                    pending.push(event);
                    while let Ok(more) = self.events.try_recv() {
                        pending.push(more);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let due = last_cycle
                        .map(|t| t.elapsed() >= self.policy.interval)
                        .unwrap_or(true);
                    if !due && !self.retries_due() {
                        continue;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            last_cycle = Some(Instant::now());
            if let Err(e) = self.cycle(pending) {
                if e.is_fatal() {
                    error!(vault = self.vault_id, error = %e, "sync loop halted");
                    let _ = self.notify.send(SyncEvent::Fatal {
                        vault_id: self.vault_id,
                        reason: e.to_string(),
                    });
                    break;
                }
                warn!(vault = self.vault_id, error = %e, "sync cycle failed");
            }
        }
        self.transition(SyncState::Idle);
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            debug!(vault = self.vault_id, from = ?self.state, to = ?next, "sync state");
            self.state = next;
        }
    }

    fn retries_due(&self) -> bool {
        let now = Instant::now();
        self.retries.iter().any(|r| r.next_due <= now)
    }

    /// One full reconciliation cycle.
    fn cycle(&mut self, pending: Vec<ChangeEvent>) -> Result<()> {
        // Local mutations outrank pull reconciliation.
        for event in pending {
            self.push_change(event, 0)?;
        }
        self.process_due_retries()?;

        self.transition(SyncState::Pulling);
        let listing = self.client.list_objects(&self.prefix)?;

        self.transition(SyncState::Reconciling);
        let remote = self.join_remote(&listing)?;
        let locals: Vec<(i64, String)> = self.store.with_conn(|conn| {
            Ok(query::entry::files_by_path(conn, self.vault_id)?
                .into_iter()
                .map(|e| (e.id, e.path))
                .collect())
        })?;
        let actions = plan_actions(
            &remote,
            &locals,
            self.policy.conflict_policy,
            self.policy.strategy,
        );

        self.transition(SyncState::Pushing);
        for action in actions {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.apply(action)?;
        }

        self.transition(SyncState::Idle);
        Ok(())
    }

    /// Resolve each remote key against the local tree and fetch the
    /// comparison hash for keys present on both sides.
    fn join_remote(&self, listing: &[RemoteObject]) -> Result<Vec<RemoteState>> {
        let mut out = Vec::with_capacity(listing.len());
        for obj in listing {
            let Ok((vault_id, chain)) = parse_remote_key(&obj.key) else {
                warn!(key = %obj.key, "unparseable remote key, skipped");
                continue;
            };
            if vault_id != self.vault_id {
                continue;
            }
            let local = self.store.with_conn(|conn| {
                query::entry::entry_by_alias_chain(conn, self.vault_id, &chain)
            })?;
            let remote_hash = if local.is_some() {
                self.client
                    .head_object(&obj.key)?
                    .remove("x-amz-meta-content-hash")
            } else {
                None
            };
            out.push(RemoteState {
                key: obj.key.clone(),
                remote_hash,
                local: local.map(|e| (e.id, e.content_hash)),
            });
        }
        Ok(out)
    }

    fn apply(&mut self, action: PlannedAction) -> Result<()> {
        match action {
            PlannedAction::Upload { entry_id } => {
                self.push_change(ChangeEvent::Upload { entry_id }, 0)
            }
            PlannedAction::Pull { key } => self.pull(&key, None),
            PlannedAction::PullReplace { key, entry_id } => self.pull(&key, Some(entry_id)),
            PlannedAction::AskConflict { entry_id, key } => {
                let (path, local_hash) = self.store.with_conn(|conn| {
                    let e = query::entry::require_by_id(conn, entry_id)?;
                    Ok((e.path, e.content_hash.unwrap_or_default()))
                })?;
                let remote_hash = self
                    .client
                    .head_object(&key)?
                    .remove("x-amz-meta-content-hash")
                    .unwrap_or_default();
                let _ = self.notify.send(SyncEvent::ConflictPending {
                    vault_id: self.vault_id,
                    path,
                    local_hash,
                    remote_hash,
                });
                Ok(())
            }
        }
    }

    /// Apply one change event remotely, on the sync pool. Transient
    /// failures re-enqueue with exponential backoff; integrity failures
    /// are dropped (never retried); fatal errors propagate.
    fn push_change(&mut self, event: ChangeEvent, attempts: u32) -> Result<()> {
        let result = match &event {
            ChangeEvent::Upload { entry_id } => {
                let entry_id = *entry_id;
                let engine = Arc::clone(&self.engine);
                let client = Arc::clone(&self.client);
                let store = self.store.clone();
                self.run_on_pool(move || upload_entry(&store, &engine, &client, entry_id))
            }
            ChangeEvent::Remove { remote_key } => {
                let client = Arc::clone(&self.client);
                let key = remote_key.clone();
                self.run_on_pool(move || match client.delete_object(&key) {
                    Err(VaultError::NotFound(_)) => Ok(()),
                    other => other,
                })
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                let backoff = Duration::from_secs(1 << attempts.min(6))
                    .min(self.policy.interval);
                debug!(vault = self.vault_id, ?event, attempts, "retrying after {:?}", backoff);
                self.retries.push(RetryItem {
                    event,
                    attempts: attempts + 1,
                    next_due: Instant::now() + backoff,
                });
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(vault = self.vault_id, ?event, error = %e, "change dropped");
                Ok(())
            }
        }
    }

    fn process_due_retries(&mut self) -> Result<()> {
        let now = Instant::now();
        let due: Vec<RetryItem> = {
            let mut remaining = Vec::new();
            let mut due = Vec::new();
            for item in self.retries.drain(..) {
                if item.next_due <= now {
                    due.push(item);
                } else {
                    remaining.push(item);
                }
            }
            self.retries = remaining;
            due
        };
        for item in due {
            self.push_change(item.event, item.attempts)?;
        }
        Ok(())
    }

    /// Download a remote object and materialize it locally, either as a
    /// new entry or replacing an existing one.
    fn pull(&mut self, key: &str, replace_entry: Option<i64>) -> Result<()> {
        let client = Arc::clone(&self.client);
        let key_owned = key.to_string();
        let sealed = self.run_on_pool(move || client.get_object(&key_owned))?;
        let head = self.client.head_object(key)?;

        let expected_hash = head.get("x-amz-meta-content-hash").cloned();
        let key_version = head
            .get("x-amz-meta-vh-key-version")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(1);

        let outcome = match replace_entry {
            Some(entry_id) => {
                let entry = self
                    .store
                    .with_conn(|conn| query::entry::require_by_id(conn, entry_id))?;
                self.engine
                    .replace_from_remote(&entry, &sealed, key_version, expected_hash.as_deref())
            }
            None => {
                let (_, chain) = parse_remote_key(key)?;
                let rel_path = head
                    .get("x-amz-meta-vh-path")
                    .cloned()
                    .unwrap_or_else(|| format!("/{}", chain.join("/")));
                self.engine
                    .adopt_remote(&rel_path, &chain, &sealed, key_version, expected_hash.as_deref())
                    .map(|_| ())
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(VaultError::Integrity(msg)) => {
                // Corrupted download: invalidate and leave for the next
                // pass; retrying the same bytes cannot help.
                error!(vault = self.vault_id, %key, %msg, "integrity failure on pull");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(vault = self.vault_id, %key, error = %e, "pull failed");
                Ok(())
            }
        }
    }

    /// Run a task on the sync pool and wait for its result.
    fn run_on_pool<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pool.submit(move || {
            let _ = tx.send(task());
        });
        rx.recv()
            .map_err(|_| VaultError::Fatal("sync pool dropped the task".into()))?
    }
}

/// Upload an entry's ciphertext, then stamp the object metadata.
fn upload_entry(
    store: &Store,
    engine: &Engine,
    client: &S3Client,
    entry_id: i64,
) -> Result<()> {
    // The entry may have been deleted since the event was queued.
    let Some(entry) = store.with_conn(|conn| query::entry::get_by_id(conn, entry_id))? else {
        return Ok(());
    };
    if entry.is_dir() {
        return Ok(()); // directories are implicit in the key namespace
    }

    let sealed = engine.sealed_bytes(&entry)?;
    let key = engine.remote_key_for(&entry)?;
    client.upload(&key, &sealed)?;

    let mut metadata = vec![
        ("vh-encrypted".to_string(), "true".to_string()),
        ("vh-algo".to_string(), "aes256gcm".to_string()),
        ("vh-key-version".to_string(), entry.key_version.to_string()),
        ("vh-path".to_string(), entry.path.clone()),
    ];
    if let Some(iv) = &entry.encryption_iv {
        metadata.push(("vh-iv".to_string(), iv.clone()));
    }
    if let Some(hash) = &entry.content_hash {
        metadata.push(("content-hash".to_string(), hash.clone()));
    }
    client.replace_metadata(&key, &metadata)?;
    debug!(%key, "pushed object with metadata");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(key: &str, remote_hash: Option<&str>, local: Option<(i64, Option<&str>)>) -> RemoteState {
        RemoteState {
            key: key.to_string(),
            remote_hash: remote_hash.map(String::from),
            local: local.map(|(id, h)| (id, h.map(String::from))),
        }
    }

    #[test]
    fn test_remote_only_pulled_for_sync_and_mirror() {
        let rs = [remote("vault-1/aa", None, None)];
        for strategy in [SyncStrategy::Sync, SyncStrategy::Mirror] {
            let actions = plan_actions(&rs, &[], ConflictPolicy::KeepLocal, strategy);
            assert_eq!(
                actions,
                vec![PlannedAction::Pull {
                    key: "vault-1/aa".into()
                }]
            );
        }

        let actions = plan_actions(&rs, &[], ConflictPolicy::KeepLocal, SyncStrategy::Cache);
        assert!(actions.is_empty(), "cache strategy never pulls eagerly");
    }

    #[test]
    fn test_local_only_uploads() {
        let locals = vec![(7, "/a/f".to_string())];
        let actions = plan_actions(&[], &locals, ConflictPolicy::KeepLocal, SyncStrategy::Sync);
        assert_eq!(actions, vec![PlannedAction::Upload { entry_id: 7 }]);
    }

    #[test]
    fn test_matching_hashes_do_nothing() {
        let rs = [remote("vault-1/aa", Some("h1"), Some((7, Some("h1"))))];
        let locals = vec![(7, "/f".to_string())];
        let actions = plan_actions(&rs, &locals, ConflictPolicy::KeepLocal, SyncStrategy::Sync);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_conflict_policies() {
        let rs = [remote("vault-1/aa", Some("remote"), Some((7, Some("local"))))];
        let locals = vec![(7, "/f".to_string())];

        let up = plan_actions(&rs, &locals, ConflictPolicy::KeepLocal, SyncStrategy::Sync);
        assert_eq!(up, vec![PlannedAction::Upload { entry_id: 7 }]);

        let over = plan_actions(&rs, &locals, ConflictPolicy::Overwrite, SyncStrategy::Sync);
        assert_eq!(over, vec![PlannedAction::Upload { entry_id: 7 }]);

        let down = plan_actions(&rs, &locals, ConflictPolicy::KeepRemote, SyncStrategy::Sync);
        assert_eq!(
            down,
            vec![PlannedAction::PullReplace {
                key: "vault-1/aa".into(),
                entry_id: 7
            }]
        );

        let ask = plan_actions(&rs, &locals, ConflictPolicy::Ask, SyncStrategy::Sync);
        assert_eq!(
            ask,
            vec![PlannedAction::AskConflict {
                entry_id: 7,
                key: "vault-1/aa".into()
            }]
        );
    }

    #[test]
    fn test_missing_remote_hash_treated_as_settled() {
        // Metadata replacement is a separate request after upload; a key
        // listed before its hash lands must not thrash.
        let rs = [remote("vault-1/aa", None, Some((7, Some("local"))))];
        let locals = vec![(7, "/f".to_string())];
        let actions = plan_actions(&rs, &locals, ConflictPolicy::KeepLocal, SyncStrategy::Sync);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_mixed_plan() {
        let rs = [
            remote("vault-1/aa", Some("h"), Some((1, Some("h")))), // settled
            remote("vault-1/bb", None, None),                      // remote-only
            remote("vault-1/cc", Some("r"), Some((2, Some("l")))), // conflict
        ];
        let locals = vec![
            (1, "/one".to_string()),
            (2, "/two".to_string()),
            (3, "/three".to_string()), // local-only
        ];
        let actions = plan_actions(&rs, &locals, ConflictPolicy::KeepLocal, SyncStrategy::Mirror);
        assert_eq!(
            actions,
            vec![
                PlannedAction::Pull {
                    key: "vault-1/bb".into()
                },
                PlannedAction::Upload { entry_id: 2 },
                PlannedAction::Upload { entry_id: 3 },
            ]
        );
    }
}
