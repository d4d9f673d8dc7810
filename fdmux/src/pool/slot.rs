//! Two-level registration table.
//!
//! Bookkeeping for armed descriptors lives in fixed-size buckets that are
//! allocated lazily and never freed before the pool drops. A registration's
//! handle is `bucket * SLOTS_PER_TABLE + offset`, so handles stay stable
//! while the table grows.
//!
//! Slots are reused, not deleted: every (un)registration and reuse bumps the
//! slot's generation counter, which is how stale event deliveries are told
//! apart from the slot's current identity.
//!
//! Locking: bucket allocation and slot (de)allocation run under the pool
//! mutex; per-slot state is guarded by the slot's own mutex. The order is
//! always pool mutex before slot lock, never the reverse.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::event::Handler;

/// Maximum number of outer buckets.
pub(crate) const TABLES: usize = 1024;

/// Slots per bucket. `TABLES * SLOTS_PER_TABLE` bounds the number of
/// concurrent registrations.
pub(crate) const SLOTS_PER_TABLE: usize = 1024;

/// Mutable bookkeeping for one registration, guarded by the slot mutex.
pub(crate) struct SlotState {
    /// The registered descriptor, or `-1` while the slot is free.
    pub(crate) fd: RawFd,

    /// Generation counter, bumped on every (un)registration and reuse.
    pub(crate) gen: u32,

    /// Desired kernel readiness mask for the next arming.
    pub(crate) events: u32,

    /// The registration's callback.
    pub(crate) handler: Option<Handler>,

    /// Close `fd` when the last reference drops.
    pub(crate) do_close: bool,

    /// Non-zero while a worker owns exclusive dispatch rights.
    pub(crate) in_handler: u32,

    /// Set after an error/hangup delivery; further error events are
    /// suppressed until unregistration.
    pub(crate) handled_error: bool,

    /// The registration is on the pool's poller-death registry.
    pub(crate) notify_poller_death: bool,
}

impl SlotState {
    fn free() -> Self {
        Self {
            fd: -1,
            gen: 0,
            events: 0,
            handler: None,
            do_close: false,
            in_handler: 0,
            handled_error: false,
            notify_poller_death: false,
        }
    }
}

/// One registration slot: an atomic reference count plus locked state.
///
/// The reference count tracks every holder of the slot outside the table:
/// the registration itself, workers mid-dispatch, and pending poller-death
/// notifications. The slot is reclaimed only when the count reaches zero.
pub(crate) struct Slot {
    refs: AtomicI64,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            refs: AtomicI64::new(0),
            state: Mutex::new(SlotState::free()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn ref_dec(&self) -> i64 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// A lazily-allocated bucket of slots.
pub(crate) struct SlotBucket {
    slots: Box<[Slot]>,

    /// Occupied-slot count; mutated under the pool mutex only.
    used: AtomicUsize,
}

impl SlotBucket {
    fn new() -> Self {
        let slots: Vec<Slot> = (0..SLOTS_PER_TABLE).map(|_| Slot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            used: AtomicUsize::new(0),
        }
    }
}

/// The two-level registration table.
///
/// Lookup by handle is lock-free; bucket allocation happens at most once
/// per outer index, under the pool mutex.
pub(crate) struct SlotTable {
    buckets: [OnceLock<Box<SlotBucket>>; TABLES],
}

impl SlotTable {
    /// Creates the table with the first bucket pre-allocated.
    pub(crate) fn new() -> Self {
        let table = Self {
            buckets: std::array::from_fn(|_| OnceLock::new()),
        };
        table.buckets[0].get_or_init(|| Box::new(SlotBucket::new()));
        table
    }

    /// Allocates a free slot for `fd` and returns its handle.
    ///
    /// Scans buckets in order, allocating a new bucket when every existing
    /// one is full; returns `None` once all `TABLES` buckets are exhausted.
    /// The slot is returned holding one reference, which belongs to the
    /// registration. The previous generation is preserved and bumped so the
    /// reused slot is distinguishable from its prior identity.
    ///
    /// Caller must hold the pool mutex.
    pub(crate) fn alloc(&self, fd: RawFd, notify_poller_death: bool) -> Option<(u32, &Slot)> {
        for (table_idx, cell) in self.buckets.iter().enumerate() {
            let bucket = cell.get_or_init(|| Box::new(SlotBucket::new()));

            if bucket.used.load(Ordering::Relaxed) == SLOTS_PER_TABLE {
                continue;
            }

            for (offset, slot) in bucket.slots.iter().enumerate() {
                let mut state = slot.lock();
                if state.fd != -1 {
                    continue;
                }

                // Wipe everything except the generation, which is bumped.
                let gen = state.gen;
                *state = SlotState::free();
                state.fd = fd;
                state.gen = gen.wrapping_add(1);
                state.notify_poller_death = notify_poller_death;
                drop(state);

                slot.ref_inc();
                bucket.used.fetch_add(1, Ordering::Relaxed);

                return Some(((table_idx * SLOTS_PER_TABLE + offset) as u32, slot));
            }
        }

        None
    }

    /// Looks up a slot by handle, taking a reference on it.
    ///
    /// Returns `None` for out-of-range handles and for buckets that were
    /// never allocated. The caller owns one reference on success and must
    /// release it through the pool.
    pub(crate) fn get(&self, idx: u32) -> Option<&Slot> {
        let table_idx = idx as usize / SLOTS_PER_TABLE;
        let offset = idx as usize % SLOTS_PER_TABLE;

        if table_idx >= TABLES {
            return None;
        }

        let bucket = self.buckets[table_idx].get()?;
        let slot = &bucket.slots[offset];
        slot.ref_inc();
        Some(slot)
    }

    /// Returns a slot to the free state for reuse.
    ///
    /// Bumps the generation so any still-pending dispatch for the old
    /// identity is filtered, and clears everything else.
    ///
    /// Caller must hold the pool mutex.
    pub(crate) fn dealloc(&self, idx: u32) {
        let table_idx = idx as usize / SLOTS_PER_TABLE;
        let offset = idx as usize % SLOTS_PER_TABLE;

        let bucket = match self.buckets.get(table_idx).and_then(|c| c.get()) {
            Some(bucket) => bucket,
            None => return,
        };

        let slot = &bucket.slots[offset];
        let mut state = slot.lock();
        let fd = state.fd;
        let gen = state.gen;
        *state = SlotState::free();
        state.gen = gen.wrapping_add(1);
        drop(state);

        if fd != -1 {
            bucket.used.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
