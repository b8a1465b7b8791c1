//! Worker pool for block compression, with one scratch buffer per worker.

use crate::error::{PakError, Result};
use std::sync::Mutex;
use tracing::debug;

const MAX_WORKERS: usize = 64;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    scratch: Vec<Mutex<Vec<u8>>>,
}

impl WorkerPool {
    /// `max(min(cores - 1, 64), 1)` workers.
    pub fn default_threads() -> usize {
        num_cpus::get().saturating_sub(1).clamp(1, MAX_WORKERS)
    }

    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads
            .unwrap_or_else(Self::default_threads)
            .clamp(1, MAX_WORKERS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pak-worker-{i}"))
            .build()
            .map_err(|e| PakError::config(format!("worker pool: {e}")))?;
        debug!(threads, "started worker pool");
        Ok(Self {
            pool,
            scratch: (0..threads).map(|_| Mutex::new(Vec::new())).collect(),
        })
    }

    pub fn threads(&self) -> usize {
        self.scratch.len()
    }

    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Runs `f` with the calling worker's scratch buffer, cleared. Outside
    /// the pool a temporary buffer is used instead.
    pub fn with_scratch<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let slot = self
            .pool
            .current_thread_index()
            .and_then(|i| self.scratch.get(i));
        match slot {
            Some(m) => {
                let mut buf = m.lock().unwrap_or_else(|p| p.into_inner());
                buf.clear();
                f(&mut buf)
            }
            None => f(&mut Vec::new()),
        }
    }

    /// Frees every scratch buffer.
    pub fn release_scratch(&self) {
        let mut freed = 0usize;
        for m in &self.scratch {
            let mut buf = m.lock().unwrap_or_else(|p| p.into_inner());
            freed += buf.capacity();
            *buf = Vec::new();
        }
        debug!(bytes = freed, "released worker scratch buffers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn workers_reuse_their_scratch() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        assert_eq!(pool.threads(), 2);
        let lens: Vec<usize> = pool.install(|| {
            (0..16usize)
                .into_par_iter()
                .map(|i| {
                    pool.with_scratch(|buf| {
                        assert!(buf.is_empty());
                        buf.resize(i * 10, 1);
                        buf.len()
                    })
                })
                .collect()
        });
        assert_eq!(lens[15], 150);
        pool.release_scratch();
        assert!(pool.scratch.iter().all(|m| m.lock().unwrap().capacity() == 0));
    }

    #[test]
    fn default_is_bounded() {
        let n = WorkerPool::default_threads();
        assert!((1..=MAX_WORKERS).contains(&n));
    }
}
