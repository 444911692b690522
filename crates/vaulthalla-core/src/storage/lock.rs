//! Path-scoped advisory locks.
//!
//! A keyed mutex table hashed by `(vault_id, canonical path)`, bucketed.
//! Write paths hold the lock for the duration of the metadata transaction
//! plus the backing-store I/O. Waiter counts are bounded so pathological
//! contention surfaces as a `Transient` error instead of a pile-up.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, VaultError};

const BUCKETS: usize = 256;
const MAX_WAITERS: usize = 32;

struct Bucket {
    lock: Mutex<()>,
    waiters: AtomicUsize,
}

/// The process-wide lock table.
pub struct PathLocks {
    buckets: Vec<Bucket>,
}

/// Holds one bucket locked; released on drop.
pub struct PathGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    waiters: &'a AtomicUsize,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS)
                .map(|_| Bucket {
                    lock: Mutex::new(()),
                    waiters: AtomicUsize::new(0),
                })
                .collect(),
        }
    }

    /// Acquire the lock covering `(vault_id, path)`.
    pub fn lock(&self, vault_id: i64, path: &str) -> Result<PathGuard<'_>> {
        let bucket = &self.buckets[Self::bucket_index(vault_id, path)];
        if bucket.waiters.fetch_add(1, Ordering::AcqRel) >= MAX_WAITERS {
            bucket.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(VaultError::Transient(format!(
                "lock contention on {path} exceeded {MAX_WAITERS} waiters"
            )));
        }
        Ok(PathGuard {
            _guard: bucket.lock.lock(),
            waiters: &bucket.waiters,
        })
    }

    /// Lock two paths without deadlocking: buckets acquire in index order.
    pub fn lock_pair(
        &self,
        vault_id: i64,
        a: &str,
        b: &str,
    ) -> Result<(PathGuard<'_>, Option<PathGuard<'_>>)> {
        let ia = Self::bucket_index(vault_id, a);
        let ib = Self::bucket_index(vault_id, b);
        if ia == ib {
            return Ok((self.lock(vault_id, a)?, None));
        }
        let (first, second) = if ia < ib { (a, b) } else { (b, a) };
        let g1 = self.lock(vault_id, first)?;
        let g2 = self.lock(vault_id, second)?;
        Ok((g1, Some(g2)))
    }

    fn bucket_index(vault_id: i64, path: &str) -> usize {
        // FNV-1a over the vault id and path bytes.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in vault_id.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        for byte in path.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % BUCKETS as u64) as usize
    }
}
