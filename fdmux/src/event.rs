use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Callback invoked by a worker thread when a registered descriptor fires.
///
/// Handlers run on pool worker threads and may be invoked for different
/// registrations concurrently, but never for the same registration: the pool
/// guarantees at most one in-flight invocation per descriptor until the
/// registrant reports the event handled.
///
/// A handler that needs the pool itself (for example to call
/// [`handled`](crate::Pool::handled) inline) should capture a
/// [`Weak`](std::sync::Weak) reference; capturing the `Arc` would keep the
/// pool alive through its own slot table.
pub type Handler = Arc<dyn Fn(Event) + Send + Sync>;

/// Stable identifier of a registration.
///
/// A handle names a slot in the pool's registration table. It stays valid
/// for the lifetime of the registration; after unregistration the slot may
/// be reused for a different descriptor, and the generation counter carried
/// in [`Event::gen`] disambiguates the two identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    /// Returns the raw slot index behind this handle.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A readiness report delivered to a registration's handler.
///
/// On normal dispatch at least one of `readable`, `writable`, or `error` is
/// set. On poller death all three are false, `poller_died` is true, and
/// `gen` carries the retirement generation; the handler must not touch the
/// registration and should return promptly.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The descriptor the event fired for.
    pub fd: RawFd,

    /// Handle of the registration the event belongs to.
    pub handle: Handle,

    /// Generation of the registration at arming time.
    ///
    /// Pass this back to [`handled`](crate::Pool::handled) so the pool can
    /// detect unregistration that happened while the handler ran.
    pub gen: u32,

    /// The descriptor is readable (data or urgent data pending).
    pub readable: bool,

    /// The descriptor is writable.
    pub writable: bool,

    /// An error or hangup condition is pending.
    pub error: bool,

    /// A worker thread retired and this registration asked to be told.
    pub poller_died: bool,
}
