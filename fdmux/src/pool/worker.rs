//! Worker threads: the dispatch loop, reconfiguration, and retirement.
//!
//! Each worker repeatedly blocks on the shared kernel handle for a single
//! event and routes it to the owning registration's handler. One-shot
//! arming guarantees the kernel hands each event to exactly one worker;
//! the slot's `in_handler` flag closes the remaining window so a handler
//! never runs concurrently with itself.
//!
//! Workers are 1-based. A worker whose index exceeds the desired count
//! retires at the top of its loop: it leaves the roster, delivers a final
//! poller-death notification to every registration that asked for one,
//! and exits. Retirements are serialized through the pool condvar so the
//! death registry is only ever held by one retiring worker.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, Handle};
use crate::poller::{unpack, RawEvent, WAKE_TOKEN};

use super::{Pool, MAX_THREADS};

impl Pool {
    /// Starts the configured number of workers and blocks until the
    /// principal worker exits.
    ///
    /// The worker count is clamped to `[1, MAX_THREADS]`. The principal
    /// worker (index 1) is joinable and joined here, so `dispatch` returns
    /// only when the pool has drained through destroy mode; all other
    /// workers are detached. Failure to start a non-principal worker is
    /// logged and tolerated.
    pub fn dispatch(&self) -> Result<()> {
        let principal;
        {
            let mut shared = self.shared.lock().unwrap();

            let count = self.event_threads.load(Ordering::Relaxed).clamp(1, MAX_THREADS);
            self.event_threads.store(count, Ordering::Release);

            principal = spawn_worker(self, 1).map_err(Error::Spawn)?;
            shared.roster[0] = true;

            for i in 1..count {
                match spawn_worker(self, i + 1) {
                    Ok(_) => shared.roster[i] = true,
                    Err(err) => warn!("failed to start poller thread {i}: {err}"),
                }
            }
        }

        let _ = principal.join();
        Ok(())
    }

    /// Changes the desired worker count.
    ///
    /// Growing spawns detached workers for the new indices, and only if
    /// [`dispatch`](Self::dispatch) already ran; a roster entry is reused
    /// only once its previous occupant is confirmed gone. Shrinking lowers
    /// the desired count and wakes the workers so the excess ones retire
    /// themselves.
    ///
    /// Outside destroy mode the count is clamped to `[1, MAX_THREADS]`;
    /// in destroy mode it is forced to zero, which drains the pool.
    pub fn reconfigure_threads(&self, count: usize) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();

            let value = if shared.destroy {
                0
            } else {
                count.clamp(1, MAX_THREADS)
            };

            let old = self.event_threads.load(Ordering::Relaxed);

            if shared.roster[0] && old < value {
                for i in old..value {
                    if !shared.roster[i] {
                        match spawn_worker(self, i + 1) {
                            Ok(_) => shared.roster[i] = true,
                            Err(err) => warn!("failed to start poller thread {i}: {err}"),
                        }
                    }
                }
            }

            // Workers above the new count observe this at the top of their
            // loop and retire themselves.
            self.event_threads.store(value, Ordering::Release);
        }

        self.poller.wake();
        Ok(())
    }

    /// Retires the calling worker if the desired count still excludes it.
    ///
    /// Returns `false` when the count was raised back before the decision
    /// became final, in which case the worker resumes its loop.
    fn try_retire(&self, index: usize) -> bool {
        let mut shared = self.shared.lock().unwrap();

        if self.event_threads.load(Ordering::Acquire) >= index {
            return false;
        }

        // At most one retirement may hold the death registry at a time.
        while shared.death_sliced {
            shared = self.cond.wait(shared).unwrap();
        }

        if self.event_threads.load(Ordering::Acquire) >= index {
            return false;
        }

        shared.roster[index - 1] = false;
        shared.active_threads -= 1;
        shared.poller_gen = shared.poller_gen.wrapping_add(1);
        let gen = shared.poller_gen;

        // Reference every watcher and take the registry private; the
        // references keep the slots alive across the unlocked notify.
        let watcher_idxs = std::mem::take(&mut shared.death_watchers);
        let mut watchers = Vec::with_capacity(watcher_idxs.len());
        for &idx in &watcher_idxs {
            if let Some(slot) = self.table.get(idx as u32) {
                watchers.push((idx, slot));
            }
        }
        shared.death_sliced = true;
        self.cond.notify_all();
        drop(shared);

        // Deliver the terminal notification outside the pool mutex. Slots
        // unregistered since the slice was taken are skipped.
        for &(idx, slot) in &watchers {
            let snapshot = {
                let state = slot.lock();
                if state.fd == -1 {
                    None
                } else {
                    state.handler.clone().map(|handler| (state.fd, handler))
                }
            };

            if let Some((fd, handler)) = snapshot {
                handler(Event {
                    fd,
                    handle: Handle(idx as u32),
                    gen,
                    readable: false,
                    writable: false,
                    error: false,
                    poller_died: true,
                });
            }
        }

        let mut shared = self.shared.lock().unwrap();
        for &(idx, slot) in &watchers {
            // Watchers unregistered during the notify are reclaimed here;
            // the rest return to the registry for the next retirement.
            if !self.slot_unref_locked(&mut shared, slot, idx as u32) {
                shared.death_watchers.push(idx);
            }
        }
        shared.death_sliced = false;
        self.cond.notify_all();
        drop(shared);

        // Cascade the wake so other workers blocked in the kernel wait
        // observe the new count too.
        self.poller.wake();
        true
    }
}

fn spawn_worker(pool: &Pool, index: usize) -> io::Result<thread::JoinHandle<()>> {
    // The upgrade cannot fail: `pool` is borrowed from a live `Arc`.
    let pool = pool.weak_self.upgrade().expect("pool has no live references");
    thread::Builder::new()
        .name(format!("fdmux{:03x}", (index - 1) & 0x3ff))
        .spawn(move || worker_loop(pool, index))
}

fn worker_loop(pool: Arc<Pool>, index: usize) {
    info!("started poller thread {}", index - 1);

    {
        let mut shared = pool.shared.lock().unwrap();
        shared.active_threads += 1;
    }

    loop {
        // Unlocked fast path; retirement re-confirms under the pool mutex.
        if pool.event_threads.load(Ordering::Acquire) < index {
            if pool.try_retire(index) {
                info!("exited poller thread {}", index - 1);
                return;
            }
            continue;
        }

        let event = match pool.poller.wait() {
            Ok(Some(event)) => event,
            Ok(None) => continue, // timeout or interrupted system call
            Err(err) => {
                error!("wait for events failed: {err}");
                continue;
            }
        };

        if event.payload == WAKE_TOKEN {
            pool.poller.ack_wake();
            continue;
        }

        dispatch_event(&pool, &event);
    }
}

/// Routes one fired event to its registration's handler.
///
/// The slot is validated under its lock: a free slot or a generation
/// mismatch means the delivery is stale, and a non-zero `in_handler` means
/// another worker still owns the slot. Only a worker that observes the
/// `in_handler` 0 -> 1 transition invokes the handler, outside the lock.
fn dispatch_event(pool: &Pool, event: &RawEvent) {
    let (idx, gen) = unpack(event.payload);

    let slot = match pool.table.get(idx) {
        Some(slot) => slot,
        None => {
            error!("no slot for handle {idx}");
            return;
        }
    };

    let mut invoke = None;
    {
        let mut state = slot.lock();

        if state.fd == -1 {
            // Unregistered in another thread after the event fired.
            debug!(
                "stale event for handle {idx}, gen {gen}, slot gen {}",
                state.gen
            );
        } else if gen != state.gen {
            // The slot was reused and is another descriptor now.
            debug!(
                "generation mismatch on handle {idx}: event gen {gen}, slot gen {}, fd {}",
                state.gen, state.fd
            );
        } else if state.in_handler > 0 {
            // Another worker owns this slot until it reports handled.
        } else if state.handled_error {
            // Error storms are delivered once per registration.
        } else {
            state.handled_error = event.error();
            state.in_handler += 1;
            debug_assert_eq!(state.in_handler, 1);
            invoke = state.handler.clone().map(|handler| (handler, state.fd));
        }
    }

    if let Some((handler, fd)) = invoke {
        handler(Event {
            fd,
            handle: Handle(idx),
            gen,
            readable: event.readable(),
            writable: event.writable(),
            error: event.error(),
            poller_died: false,
        });
    }

    pool.slot_unref(slot, idx);
}
