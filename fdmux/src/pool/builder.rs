use std::sync::Arc;
use std::thread;

use super::{Pool, MAX_THREADS};
use crate::error::Result;

/// Builder for configuring and creating an event pool.
///
/// `PoolBuilder` allows customizing pool parameters before construction:
/// the sizing hint passed to the kernel readiness facility and the number
/// of worker threads started by [`dispatch`](Pool::dispatch).
///
/// # Examples
///
/// ```rust,ignore
/// let pool = PoolBuilder::new()
///     .worker_threads(4)
///     .build()?;
/// ```
pub struct PoolBuilder {
    /// Sizing hint for the kernel readiness handle.
    size_hint: usize,

    /// Number of worker threads started at dispatch.
    worker_threads: usize,
}

impl PoolBuilder {
    /// Creates a new `PoolBuilder` with default configuration.
    ///
    /// By default the worker count is the number of available logical
    /// CPUs, capped at [`MAX_THREADS`] and falling back to `1` if
    /// unavailable.
    pub fn new() -> Self {
        let worker_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_THREADS);

        Self {
            size_hint: 1024,
            worker_threads,
        }
    }

    /// Sets the sizing hint for the kernel readiness handle.
    pub fn size_hint(mut self, n: usize) -> Self {
        self.size_hint = n;
        self
    }

    /// Sets the number of worker threads started at dispatch.
    ///
    /// Values above [`MAX_THREADS`] are clamped at dispatch time.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be > 0");

        self.worker_threads = n;
        self
    }

    /// Builds the pool with the configured options.
    pub fn build(self) -> Result<Arc<Pool>> {
        Pool::new(self.size_hint, self.worker_threads)
    }
}

impl Default for PoolBuilder {
    /// Creates a default `PoolBuilder`.
    fn default() -> Self {
        Self::new()
    }
}
