//! The event pool: registration table, kernel handle, and worker state.
//!
//! A [`Pool`] owns the kernel readiness handle, the two-level slot table,
//! the worker roster, and the poller-death registry. Registrations arm a
//! descriptor one-shot with the kernel; worker threads started by
//! [`dispatch`](Pool::dispatch) wait on the shared handle and route each
//! fired event to its registration's handler.
//!
//! Reference counting keeps a slot alive while any worker still holds it;
//! generation counters filter deliveries that outlived their registration.

mod builder;
mod slot;
mod worker;

pub use builder::PoolBuilder;

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::event::{Handle, Handler};
use crate::poller::{pack, Poller, BASE_EVENTS, EV_READ, EV_WRITE};
use slot::{Slot, SlotTable};

/// Upper bound on the number of worker threads.
pub const MAX_THREADS: usize = 32;

/// Worker-visible state guarded by the pool mutex.
pub(crate) struct PoolShared {
    /// Occupied worker indices; `false` means empty or dead.
    pub(crate) roster: [bool; MAX_THREADS],

    /// Number of worker threads currently alive.
    pub(crate) active_threads: usize,

    /// Bumped on each worker retirement; delivered as the generation of
    /// poller-death events.
    pub(crate) poller_gen: u32,

    /// Destroy mode: registrations fail and the pool may drain to zero
    /// workers.
    pub(crate) destroy: bool,

    /// Handles of registrations that asked for poller-death notification.
    pub(crate) death_watchers: Vec<usize>,

    /// A retiring worker has taken the death registry private; further
    /// retirements wait on the condvar until it is returned.
    pub(crate) death_sliced: bool,
}

/// A multi-threaded readiness-event demultiplexer.
///
/// Construct through [`PoolBuilder`] or [`Pool::new`], then call
/// [`dispatch`](Self::dispatch) from a dedicated thread to start the
/// workers. All other operations may be called from any thread.
pub struct Pool {
    pub(crate) poller: Poller,
    pub(crate) table: SlotTable,

    /// Desired worker count; read unlocked at the top of every worker
    /// loop, confirmed under the pool mutex before retirement.
    pub(crate) event_threads: AtomicUsize,

    pub(crate) shared: Mutex<PoolShared>,
    pub(crate) cond: Condvar,

    /// Self-reference handed to spawned workers; established at
    /// construction so worker threads keep the pool alive.
    pub(crate) weak_self: Weak<Pool>,
}

impl Pool {
    /// Creates a pool.
    ///
    /// `size_hint` sizes the kernel readiness handle; `worker_threads` is
    /// the number of workers [`dispatch`](Self::dispatch) will start,
    /// clamped to `[1, MAX_THREADS]` at that point.
    pub fn new(size_hint: usize, worker_threads: usize) -> Result<Arc<Self>> {
        let poller = Poller::new(size_hint).map_err(|source| Error::Kernel {
            op: "create",
            fd: -1,
            source,
        })?;

        Ok(Arc::new_cyclic(|weak| Self {
            poller,
            table: SlotTable::new(),
            event_threads: AtomicUsize::new(worker_threads),
            shared: Mutex::new(PoolShared {
                roster: [false; MAX_THREADS],
                active_threads: 0,
                poller_gen: 0,
                destroy: false,
                death_watchers: Vec::new(),
                death_sliced: false,
            }),
            cond: Condvar::new(),
            weak_self: weak.clone(),
        }))
    }

    /// Registers `fd` and arms it with the kernel.
    ///
    /// `want_read` / `want_write` follow the tri-valued interest encoding
    /// shared with [`select_on`](Self::select_on): `Some(true)` enables the
    /// interest, `Some(false)` clears it, `None` leaves it unchanged (off,
    /// for a fresh registration). Error, hangup, and urgent-data conditions
    /// are always reported.
    ///
    /// With `notify_poller_death` set, the handler additionally receives a
    /// terminal [`poller_died`](crate::Event::poller_died) call each time a
    /// worker thread retires.
    ///
    /// The returned handle stays valid until [`unregister`](Self::unregister).
    pub fn register(
        &self,
        fd: RawFd,
        want_read: Option<bool>,
        want_write: Option<bool>,
        notify_poller_death: bool,
        handler: Handler,
    ) -> Result<Handle> {
        // The destroy check and the slot allocation share one critical
        // section, so a registration can never slip in after the pool
        // entered destroy mode.
        let (idx, slot) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.destroy {
                return Err(Error::PoolClosed);
            }

            let (idx, slot) = match self.table.alloc(fd, notify_poller_death) {
                Some(entry) => entry,
                None => {
                    error!("no free slot for fd {fd}");
                    return Err(Error::CapacityExhausted);
                }
            };

            if notify_poller_death {
                shared.death_watchers.push(idx as usize);
            }

            (idx, slot)
        };

        // Arm under the slot lock only; holding the pool mutex here would
        // serialize every registration on the kernel call.
        let armed = {
            let mut state = slot.lock();
            state.events = BASE_EVENTS;
            state.handler = Some(handler);
            update_interest(&mut state.events, want_read, want_write);

            self.poller.arm(fd, state.events, pack(idx, state.gen))
        };

        if let Err(source) = armed {
            error!("failed to arm fd {fd} with the kernel: {source}");
            // Roll back the allocation: this drops the only reference.
            self.slot_unref(slot, idx);
            return Err(Error::Kernel {
                op: "add",
                fd,
                source,
            });
        }

        // The allocation reference is retained as the registration's
        // reference; unregister drops it.
        Ok(Handle(idx))
    }

    /// Updates the read/write interest of a registration.
    ///
    /// Uses the tri-valued encoding of [`register`](Self::register). While
    /// a handler is in flight for this slot the kernel call is skipped: the
    /// pending [`handled`](Self::handled) re-arm picks the update up, which
    /// both saves a syscall and keeps another worker from grabbing the next
    /// event while the ongoing handler is still in progress.
    ///
    /// # Panics
    ///
    /// Panics if `fd` is not the slot's registered descriptor.
    pub fn select_on(
        &self,
        handle: Handle,
        fd: RawFd,
        want_read: Option<bool>,
        want_write: Option<bool>,
    ) -> Result<()> {
        let idx = handle.0;
        let slot = match self.table.get(idx) {
            Some(slot) => slot,
            None => {
                error!("no slot for handle {idx}, fd {fd}");
                return Err(Error::InvalidHandle(idx));
            }
        };

        let result = {
            let mut state = slot.lock();
            assert_eq!(state.fd, fd, "handle {idx} is registered to a different fd");

            update_interest(&mut state.events, want_read, want_write);

            if state.in_handler > 0 {
                Ok(())
            } else {
                self.poller
                    .rearm(fd, state.events, pack(idx, state.gen))
                    .map_err(|source| {
                        error!("failed to modify fd {fd} with the kernel: {source}");
                        Error::Kernel {
                            op: "modify",
                            fd,
                            source,
                        }
                    })
            }
        };

        self.slot_unref(slot, idx);
        result
    }

    /// Unregisters a descriptor.
    ///
    /// The slot is reclaimed once every outstanding reference drops; a
    /// worker mid-dispatch keeps it alive until then, and the bumped
    /// generation filters any delivery that was already in flight.
    pub fn unregister(&self, handle: Handle, fd: RawFd) -> Result<()> {
        self.unregister_common(handle, fd, false)
    }

    /// Unregisters a descriptor and closes it when the last reference
    /// drops.
    pub fn unregister_close(&self, handle: Handle, fd: RawFd) -> Result<()> {
        self.unregister_common(handle, fd, true)
    }

    fn unregister_common(&self, handle: Handle, fd: RawFd, do_close: bool) -> Result<()> {
        let idx = handle.0;
        let slot = match self.table.get(idx) {
            Some(slot) => slot,
            None => {
                error!("no slot for handle {idx}, fd {fd}");
                return Err(Error::InvalidHandle(idx));
            }
        };

        let detached = {
            let mut state = slot.lock();
            assert_eq!(state.fd, fd, "handle {idx} is registered to a different fd");

            let detached = self.poller.detach(fd);
            state.do_close = do_close;
            // Invalidate any dispatch still in flight for this identity.
            state.gen = state.gen.wrapping_add(1);
            detached
        };

        // Both references are released even when the detach failed; the
        // bumped generation makes the slot safe to reuse either way.
        self.slot_unref(slot, idx); // lookup reference
        self.slot_unref(slot, idx); // registration reference

        detached.map_err(|source| {
            error!("failed to detach fd {fd} from the kernel: {source}");
            Error::Kernel {
                op: "del",
                fd,
                source,
            }
        })
    }

    /// Reports that the handler invocation for `(handle, gen)` finished.
    ///
    /// Releases the slot's dispatch exclusivity and, when the registration
    /// is still the same generation, re-arms the descriptor with the latest
    /// interest mask. Updates made through [`select_on`](Self::select_on)
    /// during handler execution take effect here.
    pub fn handled(&self, handle: Handle, fd: RawFd, gen: u32) -> Result<()> {
        let idx = handle.0;
        let slot = match self.table.get(idx) {
            Some(slot) => slot,
            None => {
                error!("no slot for handle {idx}, fd {fd}");
                return Err(Error::InvalidHandle(idx));
            }
        };

        let result = {
            let mut state = slot.lock();
            debug_assert!(state.in_handler > 0, "handled without a pending dispatch");
            state.in_handler = state.in_handler.saturating_sub(1);

            if gen != state.gen {
                // The registration was unregistered while the handler ran;
                // nothing left to re-arm.
                debug!(
                    "generation bumped on handle {idx} from {gen} to {}, fd {fd}",
                    state.gen
                );
                Ok(())
            } else if state.in_handler == 0 {
                self.poller
                    .rearm(fd, state.events, pack(idx, gen))
                    .map_err(|source| {
                        error!("failed to re-arm fd {fd} with the kernel: {source}");
                        Error::Kernel {
                            op: "modify",
                            fd,
                            source,
                        }
                    })
            } else {
                Ok(())
            }
        };

        self.slot_unref(slot, idx);
        result
    }

    /// Puts the pool into destroy mode.
    ///
    /// Subsequent registrations fail with [`Error::PoolClosed`], and
    /// [`reconfigure_threads`](Self::reconfigure_threads) to zero becomes
    /// legal, which drains the workers and lets
    /// [`dispatch`](Self::dispatch) return.
    pub fn shutdown(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.destroy = true;
        }
        self.poller.wake();
    }

    /// Number of worker threads currently alive.
    pub fn active_threads(&self) -> usize {
        self.shared.lock().unwrap().active_threads
    }

    /// Drops one reference to `slot`, reclaiming it at zero.
    ///
    /// Must not be called with the pool mutex held; reclamation takes it.
    pub(crate) fn slot_unref(&self, slot: &Slot, idx: u32) {
        if slot.ref_dec() > 0 {
            return;
        }

        // Last reference: capture the close decision under the slot lock,
        // recycle under the pool mutex, close outside both.
        let (fd, do_close) = {
            let mut state = slot.lock();
            let captured = (state.fd, state.do_close);
            state.do_close = false;
            captured
        };

        {
            let mut shared = self.shared.lock().unwrap();
            self.table.dealloc(idx);
            shared.death_watchers.retain(|&w| w != idx as usize);
        }

        if do_close && fd != -1 {
            unsafe { libc::close(fd) };
        }
    }

    /// [`slot_unref`](Self::slot_unref) for callers already holding the
    /// pool mutex. Returns whether the slot was reclaimed.
    pub(crate) fn slot_unref_locked(
        &self,
        shared: &mut PoolShared,
        slot: &Slot,
        idx: u32,
    ) -> bool {
        if slot.ref_dec() > 0 {
            return false;
        }

        let (fd, do_close) = {
            let mut state = slot.lock();
            let captured = (state.fd, state.do_close);
            state.do_close = false;
            captured
        };

        self.table.dealloc(idx);
        shared.death_watchers.retain(|&w| w != idx as usize);

        if do_close && fd != -1 {
            unsafe { libc::close(fd) };
        }
        true
    }
}

/// Applies a tri-valued interest update to an event mask.
fn update_interest(events: &mut u32, want_read: Option<bool>, want_write: Option<bool>) {
    match want_read {
        Some(true) => *events |= EV_READ,
        Some(false) => *events &= !EV_READ,
        None => {}
    }

    match want_write {
        Some(true) => *events |= EV_WRITE,
        Some(false) => *events &= !EV_WRITE,
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::update_interest;
    use crate::poller::{EV_READ, EV_WRITE};

    #[test]
    fn test_interest_update_is_tri_valued() {
        let mut events = 0;

        update_interest(&mut events, Some(true), Some(true));
        assert_eq!(events, EV_READ | EV_WRITE);

        // None leaves both bits untouched.
        update_interest(&mut events, None, None);
        assert_eq!(events, EV_READ | EV_WRITE);

        update_interest(&mut events, Some(false), None);
        assert_eq!(events, EV_WRITE);

        update_interest(&mut events, None, Some(false));
        assert_eq!(events, 0);
    }
}
