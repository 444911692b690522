//! Worker threads and their migratable pool binding.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use super::pool::PoolShared;

/// How long a reserve worker sleeps between binding checks.
const RESERVE_PARK: Duration = Duration::from_millis(20);

/// Bounded condvar wait so stop flags and rebinds are observed promptly.
const QUEUE_WAIT: Duration = Duration::from_millis(50);

/// State shared between a worker thread and whoever owns its handle.
pub(crate) struct WorkerSlot {
    /// Current pool, `None` while parked in the reserve. Re-read by the
    /// worker on every iteration; swapping it migrates the worker.
    pub binding: Mutex<Option<Arc<PoolShared>>>,
    pub idle: AtomicBool,
    pub shutdown: AtomicBool,
    pub finished: AtomicBool,
}

/// An owned worker: its slot plus the join handle.
pub(crate) struct WorkerHandle {
    pub slot: Arc<WorkerSlot>,
    pub thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker, optionally pre-bound to a pool.
    pub fn spawn(binding: Option<Arc<PoolShared>>) -> Self {
        let slot = Arc::new(WorkerSlot {
            binding: Mutex::new(binding),
            idle: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let thread_slot = Arc::clone(&slot);
        let thread = thread::Builder::new()
            .name("vh-worker".into())
            .spawn(move || worker_loop(thread_slot))
            .expect("failed to spawn pool worker");
        Self {
            slot,
            thread: Some(thread),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.slot.idle.load(Ordering::Relaxed)
    }

    /// Rebind to a new pool (or `None` for the reserve) and nudge the
    /// thread so it notices promptly.
    pub fn rebind(&self, binding: Option<Arc<PoolShared>>) {
        let previous = {
            let mut guard = self.slot.binding.lock();
            std::mem::replace(&mut *guard, binding)
        };
        if let Some(old) = previous {
            old.cv.notify_all();
        }
        if let Some(t) = &self.thread {
            t.thread().unpark();
        }
    }

    /// Ask the thread to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.slot.shutdown.store(true, Ordering::SeqCst);
        self.rebind(None);
    }

    /// Signal shutdown and wait up to `graceful` for the thread to exit;
    /// detach it if it is still running a blocking task after that.
    pub fn stop(mut self, graceful: Duration) {
        self.signal_stop();

        let deadline = Instant::now() + graceful;
        while !self.slot.finished.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("pool worker exceeded graceful timeout, detaching");
                drop(self.thread.take());
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn worker_loop(slot: Arc<WorkerSlot>) {
    loop {
        if slot.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let binding = slot.binding.lock().clone();
        match binding {
            None => thread::park_timeout(RESERVE_PARK),
            Some(pool) => consume_from(&slot, &pool),
        }
    }
    slot.finished.store(true, Ordering::Release);
}

/// Consume tasks from `pool` until the pool stops, the worker is rebound,
/// or shutdown is signalled.
fn consume_from(slot: &Arc<WorkerSlot>, pool: &Arc<PoolShared>) {
    loop {
        if slot.shutdown.load(Ordering::SeqCst) || pool.stop.load(Ordering::SeqCst) {
            return;
        }
        {
            let guard = slot.binding.lock();
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, pool) => {}
                _ => return, // migrated away
            }
        }

        let task = {
            let mut queue = pool.queue.lock();
            if queue.is_empty() {
                pool.cv.wait_for(&mut queue, QUEUE_WAIT);
            }
            queue.pop_front()
        };

        if let Some(task) = task {
            slot.idle.store(false, Ordering::Relaxed);
            // A panicking task must not take its worker down with it.
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!(pool = %pool.name, "pool task panicked");
            }
            slot.idle.store(true, Ordering::Relaxed);
        }
    }
}
