//! Worker pool and range splitting for multi-threaded transforms.
//!
//! CTR blocks are independent, so a byte range can be cut into contiguous
//! parts and each part handed to a worker with its own stream instance.
//! Parts start on chunk boundaries so no chunk is shared by two workers.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{Result, VaultError};

/// Splits `length` bytes into at most `threads` contiguous `(start, len)`
/// parts. Part boundaries are multiples of `align`; the last part takes the
/// remainder.
pub fn split_ranges(length: u64, threads: usize, align: u64) -> Vec<(u64, u64)> {
    if length == 0 {
        return Vec::new();
    }
    let threads = threads.max(1) as u64;
    let align = align.max(1);
    let mut part = length.div_ceil(threads);
    part -= part % align;
    if part == 0 {
        return vec![(0, length)];
    }
    let count = (length / part).clamp(1, threads);
    (0..count)
        .map(|i| {
            let start = i * part;
            let len = if i + 1 == count { length - start } else { part };
            (start, len)
        })
        .collect()
}

/// Fixed-size pool that lives as long as the file or session using it.
pub struct WorkerPool {
    pool: ThreadPool,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(VaultError::config("thread count must be at least 1"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("vaultfs-worker-{i}"))
            .build()
            .map_err(|e| VaultError::config(format!("building worker pool: {e}")))?;
        debug!(threads, "worker pool started");
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs every job on the pool and blocks until all finish. Results keep
    /// job order; if any job fails an error is returned instead.
    pub fn run<J, T, F>(&self, jobs: Vec<J>, work: F) -> Result<Vec<T>>
    where
        J: Send,
        T: Send,
        F: Fn(J) -> Result<T> + Send + Sync,
    {
        if jobs.len() <= 1 {
            return jobs.into_iter().map(work).collect();
        }
        self.pool.install(|| jobs.into_par_iter().map(work).collect())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(parts: &[(u64, u64)], length: u64) -> bool {
        let mut pos = 0;
        for &(start, len) in parts {
            if start != pos {
                return false;
            }
            pos += len;
        }
        pos == length
    }

    #[test]
    fn splits_on_alignment() {
        let parts = split_ranges(100, 3, 16);
        assert_eq!(parts, vec![(0, 32), (32, 32), (64, 36)]);
        let parts = split_ranges(1000, 4, 64);
        assert_eq!(parts.len(), 4);
        assert!(covers(&parts, 1000));
        assert!(parts.iter().take(3).all(|&(s, l)| s % 64 == 0 && l % 64 == 0));
    }

    #[test]
    fn small_input_is_one_part() {
        assert_eq!(split_ranges(10, 8, 16), vec![(0, 10)]);
        assert_eq!(split_ranges(1000, 4, 256), vec![(0, 1000)]);
        assert!(split_ranges(0, 4, 16).is_empty());
    }

    #[test]
    fn run_keeps_order_and_reports_errors() {
        let pool = WorkerPool::new(4).unwrap();
        let out = pool.run((0..16).collect(), |i: u32| Ok(i * 2)).unwrap();
        assert_eq!(out, (0..16).map(|i| i * 2).collect::<Vec<_>>());

        let err = pool
            .run((0..16).collect(), |i: u32| {
                if i == 7 {
                    Err(VaultError::integrity("part 7"))
                } else {
                    Ok(i)
                }
            })
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(WorkerPool::new(0).is_err());
    }
}
