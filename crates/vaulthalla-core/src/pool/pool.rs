//! A single named FIFO pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::worker::WorkerHandle;
use super::Task;

/// Queue state shared with the workers bound to this pool.
pub(crate) struct PoolShared {
    pub name: String,
    pub queue: Mutex<VecDeque<Task>>,
    pub cv: Condvar,
    pub stop: AtomicBool,
}

/// Wakes the manager's monitor when queue pressure changes.
pub(crate) struct PressureSignal {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl PressureSignal {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.flag.lock() = true;
        self.cv.notify_one();
    }

    /// Wait until notified or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cv.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }
}

/// One named pool: a FIFO queue plus the workers currently bound to it.
pub struct ThreadPool {
    pub(crate) shared: Arc<PoolShared>,
    pub(crate) workers: Mutex<Vec<WorkerHandle>>,
    pub(crate) priority: u8,
    pub(crate) min_size: usize,
    pressure: Arc<PressureSignal>,
}

impl ThreadPool {
    pub(crate) fn new(
        name: &str,
        initial_workers: usize,
        priority: u8,
        min_size: usize,
        pressure: Arc<PressureSignal>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let workers = (0..initial_workers)
            .map(|_| WorkerHandle::spawn(Some(Arc::clone(&shared))))
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
            priority,
            min_size,
            pressure,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a task and wake one worker. Never blocks the submitter
    /// beyond queue insertion; FIFO within this pool.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(Box::new(task));
        }
        self.shared.cv.notify_one();
        // Let the monitor react to the pressure change before its tick.
        self.pressure.notify();
    }

    /// Tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Adopt a worker handle: rebind it to this pool's queue.
    pub(crate) fn adopt(&self, handle: WorkerHandle) {
        handle.rebind(Some(Arc::clone(&self.shared)));
        self.workers.lock().push(handle);
        debug!(pool = %self.shared.name, "adopted worker");
    }

    /// Surrender one worker, unbound, preferring an idle one. Returns
    /// `None` if the pool has no workers.
    pub(crate) fn donate(&self) -> Option<WorkerHandle> {
        let mut workers = self.workers.lock();
        let idx = workers
            .iter()
            .position(WorkerHandle::is_idle)
            .unwrap_or(workers.len().checked_sub(1)?);
        let handle = workers.swap_remove(idx);
        drop(workers);
        handle.rebind(None);
        debug!(pool = %self.shared.name, "donated worker");
        Some(handle)
    }

    /// Clear the queue, set the stop flag, wake everyone, and join each
    /// worker; workers still running after `graceful` are detached.
    pub fn stop(&self, graceful: Duration) {
        self.shared.queue.lock().clear();
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();

        let drained: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        // Signal everyone before waiting on anyone.
        for handle in &drained {
            handle.signal_stop();
        }
        for handle in drained {
            handle.stop(graceful);
        }
        debug!(pool = %self.shared.name, "pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn pool(workers: usize) -> ThreadPool {
        ThreadPool::new("fuse", workers, 3, 2, Arc::new(PressureSignal::new()))
    }

    #[test]
    fn test_tasks_run_exactly_once() {
        let p = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            p.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 32 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        p.stop(Duration::from_millis(1200));
    }

    #[test]
    fn test_fifo_order_single_worker() {
        let p = pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            p.submit(move || {
                order.lock().push(i);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 16 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
        p.stop(Duration::from_millis(1200));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let p = pool(1);
        let ran = Arc::new(AtomicBool::new(false));
        p.submit(|| panic!("boom"));
        let flag = Arc::clone(&ran);
        p.submit(move || flag.store(true, Ordering::SeqCst));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ran.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(ran.load(Ordering::SeqCst));
        p.stop(Duration::from_millis(1200));
    }

    #[test]
    fn test_stop_clears_queue() {
        let p = pool(1);
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        // Block the single worker, then pile up tasks that must be dropped.
        p.submit(move || {
            let _ = rx.recv();
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            p.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(tx); // release the blocked task
        p.stop(Duration::from_millis(1200));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn test_adoption_moves_consumption() {
        let a = pool(1);
        let b = ThreadPool::new("sync", 1, 0, 1, Arc::new(PressureSignal::new()));

        // Move b's worker into a; a now has two workers, b none.
        let handle = b.donate().unwrap();
        a.adopt(handle);
        assert_eq!(a.worker_count(), 2);
        assert_eq!(b.worker_count(), 0);

        // Both of a's workers can run concurrently.
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let rx2 = rx.clone();
        let both = Arc::new(AtomicUsize::new(0));
        let (b1, b2) = (Arc::clone(&both), Arc::clone(&both));
        a.submit(move || {
            b1.fetch_add(1, Ordering::SeqCst);
            let _ = rx.recv();
        });
        a.submit(move || {
            b2.fetch_add(1, Ordering::SeqCst);
            let _ = rx2.recv();
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while both.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(both.load(Ordering::SeqCst), 2, "adopted worker consumes from new pool");
        drop(tx);
        a.stop(Duration::from_millis(1200));
        b.stop(Duration::from_millis(1200));
    }
}
