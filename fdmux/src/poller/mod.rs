//! Platform-specific readiness backend.
//!
//! This module provides the kernel-facing half of the pool: arming and
//! detaching descriptors, and blocking until a single event fires.
//!
//! The backend contract is edge-triggered, one-shot delivery: the kernel
//! reports at most one event per arming, each event carries the opaque
//! 64-bit payload from its most recent arming, and re-arming is the
//! registrant's responsibility.
//!
//! The concrete implementation is selected at compile time depending on
//! the target operating system.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) use epoll::{pack, unpack, Poller, RawEvent, BASE_EVENTS, EV_READ, EV_WRITE, WAKE_TOKEN};
