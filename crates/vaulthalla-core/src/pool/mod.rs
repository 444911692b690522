//! Adaptive thread-pool manager.
//!
//! A fixed set of named FIFO pools (`fuse`, `http`, `thumb`, `sync`)
//! shares one elastic population of OS-thread workers. A monitor thread
//! watches queue pressure every 50 ms and migrates workers: pools under
//! sustained backlog first adopt from the idle reserve, then steal from
//! pools of equal or lower priority; underloaded pools donate back to the
//! reserve. A worker's pool binding is held by reference and re-read every
//! loop iteration, so adoption atomically redirects which queue it
//! consumes from.

mod manager;
mod pool;
mod worker;

pub use manager::{PoolManager, PoolTotals};
pub use pool::ThreadPool;

/// An opaque callable executed exactly once on a pool worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Stealing priority of a named pool; higher steals from lower.
pub(crate) fn priority_of(name: &str) -> u8 {
    match name {
        "fuse" => 3,
        "http" => 2,
        "thumb" => 1,
        _ => 0,
    }
}

/// Floor below which the monitor never shrinks a pool.
pub(crate) fn min_pool_size(name: &str) -> usize {
    match name {
        "fuse" | "http" => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priorities() {
        assert_eq!(priority_of("fuse"), 3);
        assert_eq!(priority_of("http"), 2);
        assert_eq!(priority_of("thumb"), 1);
        assert_eq!(priority_of("sync"), 0);
    }

    #[test]
    fn test_min_sizes() {
        assert_eq!(min_pool_size("fuse"), 2);
        assert_eq!(min_pool_size("http"), 2);
        assert_eq!(min_pool_size("thumb"), 1);
        assert_eq!(min_pool_size("sync"), 1);
    }
}
