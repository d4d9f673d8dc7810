//! Linux `epoll`-based readiness backend.
//!
//! Responsibilities:
//! - Arm, re-arm, and detach file descriptors with one-shot masks
//! - Block waiting for a single readiness event
//! - Wake blocked workers when the pool is reconfigured or shut down
//!
//! Every armed descriptor carries `EPOLLONESHOT`, so the kernel disarms it
//! after reporting one event and hands that event to exactly one of the
//! threads blocked in [`wait`](Poller::wait). The pool re-arms through
//! [`rearm`](Poller::rearm) once the registrant reports the event handled.

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT,
    EPOLLOUT, EPOLLPRI, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::io;
use std::os::unix::io::RawFd;

/// Reserved payload for the internal wake event.
///
/// This value must never collide with payloads produced from slot handles.
/// Packed payloads carry a 20-bit slot index in the low word, so `u64::MAX`
/// guarantees uniqueness.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness bits requested for every armed descriptor.
///
/// Error, hangup, and urgent-data conditions are always reported, and
/// `EPOLLONESHOT` makes the kernel disarm the descriptor after one event.
pub(crate) const BASE_EVENTS: u32 = (EPOLLPRI | EPOLLHUP | EPOLLERR | EPOLLONESHOT) as u32;

/// Read-interest bit toggled by registration and `select_on`.
pub(crate) const EV_READ: u32 = EPOLLIN as u32;

/// Write-interest bit toggled by registration and `select_on`.
pub(crate) const EV_WRITE: u32 = EPOLLOUT as u32;

/// Wake tokens written per wake-up, one per worker that could be blocked.
const WAKE_BURST: u64 = 64;

/// Packs a slot handle and its generation into an event payload.
pub(crate) fn pack(idx: u32, gen: u32) -> u64 {
    ((gen as u64) << 32) | idx as u64
}

/// Recovers the `(handle, generation)` pair from an event payload.
pub(crate) fn unpack(payload: u64) -> (u32, u32) {
    (payload as u32, (payload >> 32) as u32)
}

/// A single fired event as reported by the kernel.
pub(crate) struct RawEvent {
    /// Raw readiness mask.
    pub(crate) mask: u32,

    /// Payload from the most recent arming of the descriptor.
    pub(crate) payload: u64,
}

impl RawEvent {
    /// Data or urgent data is pending.
    pub(crate) fn readable(&self) -> bool {
        self.mask & (EPOLLIN | EPOLLPRI) as u32 != 0
    }

    /// The descriptor is writable.
    pub(crate) fn writable(&self) -> bool {
        self.mask & EPOLLOUT as u32 != 0
    }

    /// An error or hangup condition fired.
    pub(crate) fn error(&self) -> bool {
        self.mask & (EPOLLERR | EPOLLHUP) as u32 != 0
    }
}

/// Linux `epoll` readiness handle.
///
/// The poller owns:
/// - an `epoll` instance shared by all worker threads,
/// - an internal `eventfd` used as a wake-up signal.
///
/// The eventfd is registered level-triggered in semaphore mode with the
/// reserved [`WAKE_TOKEN`] payload, so a single wake-up can rouse every
/// thread blocked in `epoll_wait` and each rousing consumes one token.
pub(crate) struct Poller {
    /// Epoll file descriptor.
    epfd: RawFd,

    /// Eventfd written on reconfiguration and shutdown.
    wakefd: RawFd,
}

impl Poller {
    /// Creates the epoll instance and its wake eventfd.
    ///
    /// `_size_hint` sizes the readiness set on backends that want one;
    /// `epoll_create1` ignores it.
    pub(crate) fn new(_size_hint: usize) -> io::Result<Self> {
        let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wakefd =
            unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE) };
        if wakefd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epfd, EPOLL_CTL_ADD, wakefd, &mut event) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wakefd);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Self { epfd, wakefd })
    }

    /// Arms a descriptor with the given mask and payload.
    pub(crate) fn arm(&self, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, events, payload)
    }

    /// Re-arms an already registered descriptor.
    ///
    /// Required after every delivered event (one-shot disarms), and used by
    /// interest updates outside handler execution.
    pub(crate) fn rearm(&self, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, events, payload)
    }

    /// Detaches a descriptor from the readiness set.
    pub(crate) fn detach(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, payload: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: payload,
        };

        let rc = unsafe { epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a single event fires.
    ///
    /// Returns `Ok(None)` on timeout or an interrupted system call; the
    /// caller is expected to loop.
    pub(crate) fn wait(&self) -> io::Result<Option<RawEvent>> {
        let mut event = epoll_event { events: 0, u64: 0 };

        let n = unsafe { epoll_wait(self.epfd, &mut event, 1, -1) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }

        if n == 0 {
            return Ok(None);
        }

        Ok(Some(RawEvent {
            mask: event.events,
            payload: event.u64,
        }))
    }

    /// Wakes every thread blocked in [`wait`](Self::wait).
    ///
    /// Writes one semaphore token per worker that could be blocked, so each
    /// of them observes a wake event before the tokens run out.
    pub(crate) fn wake(&self) {
        let buf: u64 = WAKE_BURST;
        unsafe {
            libc::write(self.wakefd, &buf as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Consumes one wake token after a wake event was observed.
    pub(crate) fn ack_wake(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.wakefd, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakefd);
            libc::close(self.epfd);
        }
    }
}
