//! The pool-of-pools manager and its rebalancing monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::pool::{PressureSignal, ThreadPool};
use super::worker::WorkerHandle;
use super::{min_pool_size, priority_of};
use crate::config::PoolConfig;

/// Monitor period between rebalance passes.
const MONITOR_PERIOD: Duration = Duration::from_millis(50);

/// Snapshot of worker distribution, for observability and invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTotals {
    /// `(pool name, worker count)` pairs.
    pub pools: Vec<(String, usize)>,
    pub reserve: usize,
    pub total: usize,
}

impl PoolTotals {
    /// Workers bound to pools plus the reserve always equals the
    /// population established at init.
    pub fn conserved(&self) -> bool {
        self.pools.iter().map(|(_, n)| n).sum::<usize>() + self.reserve == self.total
    }
}

/// Process-wide owner of the named pools and the worker reserve.
pub struct PoolManager {
    /// Pools in descending priority order, the monitor's scan order.
    pools: Vec<Arc<ThreadPool>>,
    reserve: Mutex<Vec<WorkerHandle>>,
    /// Serializes worker migration against observation, so totals never
    /// see a worker in flight between two pools.
    transfer_lock: Mutex<()>,
    pressure: Arc<PressureSignal>,
    stop: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    total_threads: usize,
    high_pressure: usize,
    low_pressure: usize,
    graceful_timeout: Duration,
}

impl PoolManager {
    /// Build the pools, fill the reserve, and start the monitor.
    ///
    /// Total worker handles = `max(hw_concurrency * reserve_factor, 12)`;
    /// whatever the initial pool sizes don't claim parks in the reserve.
    pub fn init(cfg: &PoolConfig) -> Arc<Self> {
        let total = (num_cpus::get() * cfg.reserve_factor).max(12);
        Self::build(cfg, total, true)
    }

    pub(crate) fn build(cfg: &PoolConfig, total: usize, spawn_monitor: bool) -> Arc<Self> {
        let pressure = Arc::new(PressureSignal::new());
        let sized = [
            ("fuse", cfg.fuse),
            ("http", cfg.http),
            ("thumb", cfg.thumb),
            ("sync", cfg.sync),
        ];
        let assigned: usize = sized.iter().map(|(_, n)| n).sum();
        let total = total.max(assigned);

        let mut pools: Vec<Arc<ThreadPool>> = sized
            .iter()
            .map(|(name, n)| {
                Arc::new(ThreadPool::new(
                    name,
                    *n,
                    priority_of(name),
                    min_pool_size(name),
                    Arc::clone(&pressure),
                ))
            })
            .collect();
        pools.sort_by(|a, b| b.priority.cmp(&a.priority));

        let reserve: Vec<WorkerHandle> = (0..total - assigned)
            .map(|_| WorkerHandle::spawn(None))
            .collect();

        info!(
            total,
            reserve = reserve.len(),
            "thread-pool manager initialized"
        );

        let manager = Arc::new(Self {
            pools,
            reserve: Mutex::new(reserve),
            transfer_lock: Mutex::new(()),
            pressure,
            stop: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            running: AtomicBool::new(true),
            total_threads: total,
            high_pressure: cfg.high_pressure,
            low_pressure: cfg.low_pressure,
            graceful_timeout: Duration::from_millis(cfg.graceful_timeout_ms),
        });

        if spawn_monitor {
            let m = Arc::clone(&manager);
            let handle = thread::Builder::new()
                .name("vh-pool-monitor".into())
                .spawn(move || m.monitor_loop())
                .expect("failed to spawn pool monitor");
            *manager.monitor.lock() = Some(handle);
        }

        manager
    }

    pub fn get(&self, name: &str) -> Option<Arc<ThreadPool>> {
        self.pools.iter().find(|p| p.name() == name).cloned()
    }

    pub fn fuse_pool(&self) -> Arc<ThreadPool> {
        self.get("fuse").expect("fuse pool exists")
    }

    pub fn http_pool(&self) -> Arc<ThreadPool> {
        self.get("http").expect("http pool exists")
    }

    pub fn thumb_pool(&self) -> Arc<ThreadPool> {
        self.get("thumb").expect("thumb pool exists")
    }

    pub fn sync_pool(&self) -> Arc<ThreadPool> {
        self.get("sync").expect("sync pool exists")
    }

    /// Current worker distribution.
    pub fn totals(&self) -> PoolTotals {
        let _guard = self.transfer_lock.lock();
        PoolTotals {
            pools: self
                .pools
                .iter()
                .map(|p| (p.name().to_string(), p.worker_count()))
                .collect(),
            reserve: self.reserve.lock().len(),
            total: self.total_threads,
        }
    }

    fn monitor_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            self.rebalance_once();
            self.pressure.wait(MONITOR_PERIOD);
        }
    }

    /// One rebalance pass over the pools in priority order.
    ///
    /// Backlogged pools adopt from the reserve, else steal from an
    /// equal-or-lower-priority donor that is itself underloaded and above
    /// its floor; a worker never migrates from a higher-priority pool to
    /// a lower-priority one. Underloaded pools donate back to the reserve.
    pub(crate) fn rebalance_once(&self) {
        let _guard = self.transfer_lock.lock();
        for pool in &self.pools {
            let pending = pool.pending();
            let workers = pool.worker_count();

            if pending > workers * self.high_pressure {
                let adopted = self.reserve.lock().pop();
                match adopted {
                    Some(handle) => {
                        debug!(pool = %pool.name(), "adopting reserve worker under pressure");
                        pool.adopt(handle);
                    }
                    None => self.steal_for(pool),
                }
            } else if pending < workers * self.low_pressure && workers > pool.min_size {
                if let Some(handle) = pool.donate() {
                    self.reserve.lock().push(handle);
                    debug!(pool = %pool.name(), "returned idle worker to reserve");
                }
            }
        }
    }

    /// Steal one worker for `needy` from the lowest-priority eligible
    /// donor.
    fn steal_for(&self, needy: &Arc<ThreadPool>) {
        for donor in self.pools.iter().rev() {
            if Arc::ptr_eq(donor, needy) {
                continue;
            }
            if donor.priority > needy.priority {
                continue;
            }
            if donor.pending() >= donor.worker_count() / 2 {
                continue;
            }
            if donor.worker_count() <= donor.min_size {
                continue;
            }
            if let Some(handle) = donor.donate() {
                debug!(from = %donor.name(), to = %needy.name(), "stole worker");
                needy.adopt(handle);
                return;
            }
        }
    }

    /// Stop the monitor, drain every pool, and join every worker.
    /// Blocking; safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        self.pressure.notify();
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }

        for pool in &self.pools {
            pool.stop(self.graceful_timeout);
        }
        let reserve: Vec<WorkerHandle> = std::mem::take(&mut *self.reserve.lock());
        for handle in reserve {
            handle.stop(self.graceful_timeout);
        }
        info!("thread-pool manager shut down");
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
