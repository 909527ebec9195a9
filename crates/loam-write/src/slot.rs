//! Writer slots: the intrusive nodes of the commit queues.
//!
//! Every in-flight write occupies one slot in a fixed pool owned by the
//! coordinator. The intrusive queue links (`link_older`, `link_newer`,
//! `write_group`) are atomic slot indices with [`NIL`] as the null value,
//! and the queue tails are atomic index words, so the enqueue fast path is
//! a single CAS with no allocation and no lock.
//!
//! # Slot lifetime
//!
//! A slot is claimed before enqueue and released only after its submitter
//! has observed `COMPLETED` (or abandoned the queue through the unbatched
//! path). A departing leader detaches a writer from the tail before
//! completing it, so an index held in a queue tail always denotes the
//! writer currently occupying that slot; index reuse cannot produce a
//! stale CAS.
//!
//! # Reserved indices
//!
//! - Slot [`STALL_SLOT`] is the write-stall sentinel. Its identity, not
//!   its contents, marks back-pressure; it carries no batch so group
//!   assembly can never admit it.
//! - Slot [`DUMMY_SLOT`] is the boundary marker a departing pipelined
//!   leader parks at the tail while electing its successor. Only one
//!   leader exits at a time, so one slot suffices.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use loam_error::Result;
use loam_types::WriteBatch;
use parking_lot::{Condvar, Mutex};

use crate::sink::WriteCallback;

// ---------------------------------------------------------------------------
// Writer states
// ---------------------------------------------------------------------------

/// Freshly enqueued; not yet claimed by any leader.
pub const STATE_INIT: u8 = 1;
/// Head of the primary queue; responsible for assembling a group and
/// driving its WAL work.
pub const STATE_GROUP_LEADER: u8 = 2;
/// Head of the memtable queue (pipelined mode only).
pub const STATE_MEMTABLE_WRITER_LEADER: u8 = 4;
/// Member of a group performing its own memtable insertion.
pub const STATE_PARALLEL_MEMTABLE_WRITER: u8 = 8;
/// Terminal: the write's status is final.
pub const STATE_COMPLETED: u8 = 16;
/// The waiter has advertised its park mutex; a waker must hand off the
/// next state under that mutex.
pub const STATE_LOCKED_WAITING: u8 = 32;

// ---------------------------------------------------------------------------
// Writer flags (set before enqueue, immutable afterwards)
// ---------------------------------------------------------------------------

pub(crate) const FLAG_SYNC: u8 = 1;
pub(crate) const FLAG_DISABLE_WAL: u8 = 1 << 1;
pub(crate) const FLAG_NO_SLOWDOWN: u8 = 1 << 2;
pub(crate) const FLAG_DISABLE_MEMTABLE: u8 = 1 << 3;
pub(crate) const FLAG_HAS_BATCH: u8 = 1 << 4;
pub(crate) const FLAG_ALLOW_BATCHING: u8 = 1 << 5;
pub(crate) const FLAG_HAS_MERGE: u8 = 1 << 6;

// ---------------------------------------------------------------------------
// Slot indices
// ---------------------------------------------------------------------------

/// Null slot index.
pub(crate) const NIL: u32 = u32::MAX;
/// The write-stall sentinel.
pub(crate) const STALL_SLOT: u32 = 0;
/// The departing-leader boundary marker.
pub(crate) const DUMMY_SLOT: u32 = 1;
/// First index handed out to real writers.
pub(crate) const FIRST_POOL_SLOT: u32 = 2;

// ---------------------------------------------------------------------------
// Cache-line alignment
// ---------------------------------------------------------------------------

/// Forces each pool element onto its own cache line so that neighboring
/// writers spinning on their state words do not false-share.
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) T);

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Park state (blocking wait tier)
// ---------------------------------------------------------------------------

/// Mutex/condvar pair for the blocking tier, constructed lazily on first
/// use so the uncontended fast path never pays for it.
#[derive(Default)]
pub(crate) struct ParkState {
    pub(crate) mu: Mutex<()>,
    pub(crate) cv: Condvar,
}

// ---------------------------------------------------------------------------
// Group header
// ---------------------------------------------------------------------------

/// Metadata for a write group, stored in the slot of the leader that
/// assembled it. Followers reach it through their `write_group` index;
/// the leader's slot outlives every follower's interest in it because the
/// leader always exits last.
pub(crate) struct GroupHeader {
    /// Current leader (shifts if the original leader is completed early
    /// in the pipelined WAL exit).
    pub(crate) leader: AtomicU32,
    /// Newest member of the group.
    pub(crate) last_writer: AtomicU32,
    /// Member count.
    pub(crate) size: AtomicUsize,
    /// Outstanding parallel memtable writers; the writer that decrements
    /// this to zero drives the group exit.
    pub(crate) running: AtomicUsize,
    /// Sequence of the final operation in the group.
    pub(crate) last_sequence: AtomicU64,
    /// Aggregated status. Written by followers on failure; the only place
    /// a follower writes into leader-owned storage.
    pub(crate) status: Mutex<Result<()>>,
}

impl GroupHeader {
    fn new() -> Self {
        Self {
            leader: AtomicU32::new(NIL),
            last_writer: AtomicU32::new(NIL),
            size: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            last_sequence: AtomicU64::new(0),
            status: Mutex::new(Ok(())),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer payload
// ---------------------------------------------------------------------------

/// The non-atomic cargo of a writer. Published to the leader by the tail
/// CAS; the mutex is never contended in the protocol's steady state (the
/// owner and the leader touch it at disjoint protocol stages).
pub(crate) struct WriterPayload {
    pub(crate) batch: Option<WriteBatch>,
    pub(crate) callback: Option<Box<dyn WriteCallback>>,
    pub(crate) status: Result<()>,
}

impl Default for WriterPayload {
    fn default() -> Self {
        Self {
            batch: None,
            callback: None,
            status: Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer slot
// ---------------------------------------------------------------------------

pub(crate) struct WriterSlot {
    pub(crate) claimed: AtomicBool,
    pub(crate) state: AtomicU8,
    pub(crate) flags: AtomicU8,
    pub(crate) link_older: AtomicU32,
    pub(crate) link_newer: AtomicU32,
    /// Index of the slot holding this writer's [`GroupHeader`].
    pub(crate) write_group: AtomicU32,
    /// Sequence assigned to the batch's first operation.
    pub(crate) sequence: AtomicU64,
    /// Cached batch byte size, so assembly never touches the payload.
    pub(crate) batch_size: AtomicU64,
    /// Cached batch operation count.
    pub(crate) batch_count: AtomicU64,
    pub(crate) payload: Mutex<WriterPayload>,
    pub(crate) group: GroupHeader,
    pub(crate) park: OnceLock<ParkState>,
}

impl WriterSlot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            state: AtomicU8::new(STATE_INIT),
            flags: AtomicU8::new(0),
            link_older: AtomicU32::new(NIL),
            link_newer: AtomicU32::new(NIL),
            write_group: AtomicU32::new(NIL),
            sequence: AtomicU64::new(0),
            batch_size: AtomicU64::new(0),
            batch_count: AtomicU64::new(0),
            payload: Mutex::new(WriterPayload::default()),
            group: GroupHeader::new(),
            park: OnceLock::new(),
        }
    }

    #[inline]
    pub(crate) fn flag(&self, bit: u8) -> bool {
        // Flags are written before the slot is published and never change
        // while it is queued.
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_INIT, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.link_older.store(NIL, Ordering::Relaxed);
        self.link_newer.store(NIL, Ordering::Relaxed);
        self.write_group.store(NIL, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Relaxed);
        self.batch_size.store(0, Ordering::Relaxed);
        self.batch_count.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Slot pool
// ---------------------------------------------------------------------------

pub(crate) struct SlotPool {
    slots: Box<[CacheAligned<WriterSlot>]>,
    /// Rotating scan start, so claimants do not all hammer slot 2.
    claim_hint: AtomicUsize,
    free_mu: Mutex<()>,
    free_cv: Condvar,
}

impl SlotPool {
    pub(crate) fn new(max_writers: usize) -> Self {
        let total = max_writers + FIRST_POOL_SLOT as usize;
        let slots: Vec<CacheAligned<WriterSlot>> =
            (0..total).map(|_| CacheAligned(WriterSlot::new())).collect();
        let pool = Self {
            slots: slots.into_boxed_slice(),
            claim_hint: AtomicUsize::new(0),
            free_mu: Mutex::new(()),
            free_cv: Condvar::new(),
        };
        // Reserved slots are never handed out.
        pool.slots[STALL_SLOT as usize]
            .claimed
            .store(true, Ordering::Relaxed);
        pool.slots[DUMMY_SLOT as usize]
            .claimed
            .store(true, Ordering::Relaxed);
        pool
    }

    #[inline]
    pub(crate) fn slot(&self, idx: u32) -> &WriterSlot {
        &self.slots[idx as usize]
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len() - FIRST_POOL_SLOT as usize
    }

    /// Claim a free slot, parking if every slot is in flight. The slot
    /// comes back reset to `INIT` with no links and no payload.
    pub(crate) fn claim(&self) -> u32 {
        loop {
            if let Some(idx) = self.try_claim() {
                return idx;
            }
            let mut guard = self.free_mu.lock();
            // A release may have raced the failed scan.
            if let Some(idx) = self.try_claim() {
                return idx;
            }
            self.free_cv.wait(&mut guard);
        }
    }

    fn try_claim(&self) -> Option<u32> {
        let n = self.capacity();
        let start = self.claim_hint.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let idx = FIRST_POOL_SLOT as usize + (start + i) % n;
            let slot = &self.slots[idx];
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.reset();
                return Some(idx as u32);
            }
        }
        None
    }

    pub(crate) fn release(&self, idx: u32) {
        debug_assert!(idx >= FIRST_POOL_SLOT);
        let slot = self.slot(idx);
        {
            let mut payload = slot.payload.lock();
            payload.batch = None;
            payload.callback = None;
            payload.status = Ok(());
        }
        slot.claimed.store(false, Ordering::Release);
        let _guard = self.free_mu.lock();
        self.free_cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserved_slots_never_claimed() {
        let pool = SlotPool::new(4);
        for _ in 0..4 {
            let idx = pool.claim();
            assert!(idx >= FIRST_POOL_SLOT);
        }
    }

    #[test]
    fn claim_release_cycle() {
        let pool = SlotPool::new(2);
        let a = pool.claim();
        let b = pool.claim();
        assert_ne!(a, b);
        pool.release(a);
        let c = pool.claim();
        assert_eq!(c, a);
    }

    #[test]
    fn claim_parks_until_release() {
        let pool = Arc::new(SlotPool::new(1));
        let held = pool.claim();

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || p.claim());

        thread::sleep(std::time::Duration::from_millis(50));
        pool.release(held);
        let got = waiter.join().unwrap();
        assert_eq!(got, held);
    }

    #[test]
    fn reset_clears_links() {
        let pool = SlotPool::new(1);
        let idx = pool.claim();
        let slot = pool.slot(idx);
        slot.link_older.store(7, Ordering::Relaxed);
        slot.link_newer.store(8, Ordering::Relaxed);
        slot.write_group.store(9, Ordering::Relaxed);
        pool.release(idx);
        let again = pool.claim();
        assert_eq!(again, idx);
        assert_eq!(slot.link_older.load(Ordering::Relaxed), NIL);
        assert_eq!(slot.link_newer.load(Ordering::Relaxed), NIL);
        assert_eq!(slot.write_group.load(Ordering::Relaxed), NIL);
        assert_eq!(slot.state.load(Ordering::Relaxed), STATE_INIT);
    }
}
