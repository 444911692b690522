//! Change-data events flowing between the storage engine and the
//! per-vault sync loops.

/// A local mutation the sync controller must propagate to the remote.
///
/// Produced by the storage engine on every content-changing operation of
/// an S3-backed vault; consumed by that vault's sync loop with higher
/// priority than pull reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Entry content or location changed; upload it under its current key.
    Upload { entry_id: i64 },
    /// A remote key no longer has a local counterpart; delete it.
    Remove { remote_key: String },
}

/// Out-of-band notifications surfaced by a sync loop for external
/// collaborators (shell, HTTP layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Both sides changed and the policy is `ask`; no automatic action.
    ConflictPending {
        vault_id: i64,
        path: String,
        local_hash: String,
        remote_hash: String,
    },
    /// The loop for this vault halted (SigV4 rejection, dead store).
    Fatal { vault_id: i64, reason: String },
}
