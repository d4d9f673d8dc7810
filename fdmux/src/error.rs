use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by pool operations.
///
/// Stale deliveries (generation mismatch, reused slot) are recovered
/// internally and never surface here; the same goes for interrupted
/// system calls during the kernel wait.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool is in destroy mode and accepts no new registrations.
    #[error("event pool is shutting down")]
    PoolClosed,

    /// Every slot in every bucket of the registration table is in use.
    #[error("slot table exhausted")]
    CapacityExhausted,

    /// The handle is out of range or names a bucket that was never
    /// allocated.
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// The kernel readiness facility rejected an arm, re-arm, or detach.
    #[error("epoll {op} failed for fd {fd}")]
    Kernel {
        /// The control operation that failed (`create`, `add`, `modify`,
        /// `del`).
        op: &'static str,

        /// The descriptor the operation targeted (`-1` for `create`).
        fd: RawFd,

        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The principal worker thread could not be spawned.
    #[error("failed to spawn poller thread")]
    Spawn(#[source] io::Error),
}
