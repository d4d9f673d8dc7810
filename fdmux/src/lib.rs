//! # fdmux
//!
//! **fdmux** is a multi-threaded readiness-event demultiplexer: it accepts
//! many file descriptors, arms the kernel's one-shot readiness facility for
//! them, and dispatches fired events to user-supplied handlers across a pool
//! of worker threads. It is designed as the I/O foundation for network
//! stacks that register sockets and consume callbacks.
//!
//! The engine provides:
//!
//! - A **shared kernel readiness handle** polled by N worker threads without
//!   serializing handler execution
//! - **One-shot arming**: the kernel reports at most one event per arming,
//!   and re-arming is deferred until the registrant reports the event
//!   [`handled`](Pool::handled)
//! - **Exclusive dispatch**: at most one worker runs a given descriptor's
//!   handler at any instant, so handlers need no re-entrancy
//! - **Live reconfiguration** of the worker count, growing and shrinking
//!   without losing registrations
//! - **Poller-death notification**: registrations may ask for a final
//!   handler call when a worker thread retires
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fdmux::{Event, PoolBuilder};
//! use std::sync::Arc;
//!
//! let pool = PoolBuilder::new().worker_threads(4).build()?;
//!
//! // Dispatch blocks until the pool drains; run it on its own thread.
//! let dispatcher = {
//!     let pool = pool.clone();
//!     std::thread::spawn(move || pool.dispatch())
//! };
//!
//! let handle = pool.register(
//!     fd,
//!     Some(true), // readable interest
//!     None,       // write interest unchanged (off)
//!     false,      // no poller-death notification
//!     Arc::new(|event: Event| {
//!         // Consume readiness here, then report `handled` so the
//!         // descriptor is re-armed with the kernel.
//!     }),
//! )?;
//! ```
//!
//! ## Modules
//!
//! - [`Pool`] / [`PoolBuilder`]: the event pool and its configuration
//! - [`Event`]: the readiness report delivered to handlers
//! - [`Error`]: failures surfaced to callers

mod error;
mod event;
mod poller;
mod pool;

pub use error::{Error, Result};
pub use event::{Event, Handle, Handler};
pub use pool::{Pool, PoolBuilder, MAX_THREADS};
