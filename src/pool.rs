//! Worker pool
//!
//! A thin wrapper over a dedicated rayon thread pool, sized from the
//! detected topology. All parallel weight work in the crate goes through
//! [`WorkerPool::run`] or [`WorkerPool::run_range`]; both are synchronous
//! and return only after every partition completes. Worker panics propagate
//! to the caller, so a failed parallel operation never completes partially
//! in silence.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{PonderarError, Result};
use crate::topology::Topology;

pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
}

impl WorkerPool {
    /// Build a pool with one worker per detected logical core.
    pub fn new(topology: &Topology) -> Result<Self> {
        let workers = topology.num_cores.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ponderar-worker-{i}"))
            .build()
            .map_err(|e| PonderarError::Io {
                message: format!("failed to build worker pool: {e}"),
            })?;
        Ok(Self { pool, workers })
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Run `f(i)` for every `i in 0..n`. Tasks must be independent; order
    /// of execution is unspecified.
    pub fn run<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        self.pool
            .install(|| (0..n).into_par_iter().for_each(|i| f(i)));
    }

    /// Partition `0..n` into at most one contiguous range per worker and
    /// run `f(range)` on each. Ranges are disjoint and cover `0..n`.
    pub fn run_range<F>(&self, n: usize, f: F)
    where
        F: Fn(std::ops::Range<usize>) + Sync,
    {
        if n == 0 {
            return;
        }
        let parts = self.workers.min(n);
        self.pool.install(|| {
            (0..parts).into_par_iter().for_each(|p| {
                let begin = p * n / parts;
                let end = (p + 1) * n / parts;
                f(begin..end);
            });
        });
    }
}

/// Raw pointer that may cross worker threads. Callers must guarantee the
/// regions touched by different workers are disjoint.
pub(crate) struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    /// A mutable slice of `len` elements starting at `offset`.
    pub unsafe fn slice_at(&self, offset: usize, len: usize) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.0.add(offset), len)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(cores: usize) -> WorkerPool {
        WorkerPool::new(&Topology::single_node(cores)).unwrap()
    }

    #[test]
    fn test_run_visits_every_index_once() {
        let pool = pool(4);
        let hits: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        pool.run(100, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        for h in &hits {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_run_range_covers_disjoint() {
        let pool = pool(3);
        let hits: Vec<AtomicUsize> = (0..17).map(|_| AtomicUsize::new(0)).collect();
        pool.run_range(17, |range| {
            for i in range {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        for h in &hits {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_run_range_empty_and_small() {
        let pool = pool(8);
        pool.run_range(0, |_| panic!("no ranges for n = 0"));
        let count = AtomicUsize::new(0);
        pool.run_range(2, |range| {
            count.fetch_add(range.len(), Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(pool(6).num_workers(), 6);
    }
}
