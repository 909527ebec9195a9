//! The write coordinator: lock-free writer queues and leader election.
//!
//! Two intrusive queues share the slot pool. `newest_writer` is the
//! primary queue every write joins; `newest_memtable_writer` is the
//! second-stage queue used when pipelined writes are enabled. Each queue
//! is just an atomic tail index: enqueueing is a CAS that splices the new
//! writer's `link_older` to the old tail, and the writer that finds the
//! tail empty is the leader.
//!
//! Forward (`link_newer`) pointers are materialized lazily, and only ever
//! by the queue's current leader, so the walk cannot race another walker.
//! Back-pressure re-uses the same queue: a distinguished sentinel slot is
//! parked at the tail, failing `no_slowdown` writers on sight and holding
//! everyone else on a condvar until the stall ends.

use std::sync::atomic::{AtomicU32, Ordering};

use loam_error::{LoamError, Result};
use loam_types::{SequenceNumber, WriteBatch, WriteConfig, WriteOptions};
use parking_lot::{Condvar, Mutex};

use crate::metrics;
use crate::sink::WriteCallback;
use crate::slot::{
    SlotPool, WriterSlot, DUMMY_SLOT, FLAG_ALLOW_BATCHING, FLAG_DISABLE_MEMTABLE,
    FLAG_DISABLE_WAL, FLAG_HAS_BATCH, FLAG_HAS_MERGE, FLAG_NO_SLOWDOWN, FLAG_SYNC, NIL,
    STALL_SLOT, STATE_COMPLETED, STATE_GROUP_LEADER, STATE_INIT, STATE_MEMTABLE_WRITER_LEADER,
    STATE_PARALLEL_MEMTABLE_WRITER,
};
use crate::wait::{await_state, set_state, AdaptationContext, YieldPolicy};

static JOIN_BATCH_GROUP_CTX: AdaptationContext = AdaptationContext::new("join_batch_group");
static ENTER_UNBATCHED_CTX: AdaptationContext = AdaptationContext::new("enter_unbatched");
static WAIT_FOR_MEMTABLE_CTX: AdaptationContext =
    AdaptationContext::new("wait_for_memtable_writers");
static AWAIT_WRITER_CTX: AdaptationContext = AdaptationContext::new("await_writer");

/// Handle to a claimed writer slot. Owned by the submitting caller from
/// registration until [`WriteController::finish_writer`] consumes it.
#[derive(Debug)]
pub struct WriterTicket {
    pub(crate) idx: u32,
}

/// Handle to a write group, naming the slot that holds its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupToken {
    pub(crate) header: u32,
}

/// The group-commit coordinator. One per engine instance.
pub struct WriteController {
    pub(crate) pool: SlotPool,
    /// Tail of the primary (WAL-stage) queue.
    pub(crate) newest_writer: AtomicU32,
    /// Tail of the memtable-stage queue (pipelined mode).
    pub(crate) newest_memtable_writer: AtomicU32,
    stall_mu: Mutex<()>,
    stall_cv: Condvar,
    pub(crate) policy: YieldPolicy,
    pub(crate) pipelined: bool,
    pub(crate) allow_concurrent_memtable_write: bool,
}

impl WriteController {
    /// Build a coordinator from validated configuration.
    #[must_use]
    pub fn new(config: &WriteConfig) -> Self {
        let config = config.validated();
        Self {
            pool: SlotPool::new(config.max_writers),
            newest_writer: AtomicU32::new(NIL),
            newest_memtable_writer: AtomicU32::new(NIL),
            stall_mu: Mutex::new(()),
            stall_cv: Condvar::new(),
            policy: YieldPolicy {
                max_yield_usec: config.max_yield_usec(),
                slow_yield_usec: config.write_thread_slow_yield_usec,
            },
            pipelined: config.enable_pipelined_write,
            allow_concurrent_memtable_write: config.allow_concurrent_memtable_write,
        }
    }

    /// Whether the two-stage pipeline is enabled.
    #[must_use]
    pub const fn pipelined(&self) -> bool {
        self.pipelined
    }

    /// Whether followers may insert into the memtable in parallel.
    #[must_use]
    pub const fn allow_concurrent_memtable_write(&self) -> bool {
        self.allow_concurrent_memtable_write
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    /// Claim a slot for one write. `batch` is `None` for unbatched
    /// exclusive operations.
    pub fn register_writer(
        &self,
        batch: Option<WriteBatch>,
        opts: &WriteOptions,
        callback: Option<Box<dyn WriteCallback>>,
    ) -> WriterTicket {
        let idx = self.pool.claim();
        let slot = self.pool.slot(idx);

        let mut flags = 0;
        if opts.sync {
            flags |= FLAG_SYNC;
        }
        if opts.disable_wal {
            flags |= FLAG_DISABLE_WAL;
        }
        if opts.no_slowdown {
            flags |= FLAG_NO_SLOWDOWN;
        }
        if opts.disable_memtable {
            flags |= FLAG_DISABLE_MEMTABLE;
        }
        if let Some(b) = &batch {
            flags |= FLAG_HAS_BATCH;
            if b.has_merge() {
                flags |= FLAG_HAS_MERGE;
            }
            slot.batch_size.store(b.byte_size() as u64, Ordering::Relaxed);
            slot.batch_count.store(b.count(), Ordering::Relaxed);
        }
        // Snapshot the batching answer now; the query is pure and this
        // keeps group assembly off the payload mutex.
        if callback.as_ref().map_or(true, |c| c.allow_batching()) {
            flags |= FLAG_ALLOW_BATCHING;
        }
        slot.flags.store(flags, Ordering::Relaxed);

        let mut payload = slot.payload.lock();
        payload.batch = batch;
        payload.callback = callback;
        payload.status = Ok(());
        drop(payload);

        WriterTicket { idx }
    }

    /// Consume a finished writer, returning its status and the sequence
    /// assigned to its first operation.
    pub fn finish_writer(&self, w: WriterTicket) -> (Result<()>, SequenceNumber) {
        let slot = self.pool.slot(w.idx);
        let seq = SequenceNumber(slot.sequence.load(Ordering::Acquire));
        let status = {
            let mut payload = slot.payload.lock();
            payload.batch = None;
            payload.callback = None;
            std::mem::replace(&mut payload.status, Ok(()))
        };
        self.pool.release(w.idx);
        (status, seq)
    }

    // -----------------------------------------------------------------
    // Queue primitives
    // -----------------------------------------------------------------

    /// Publish `idx` as the new tail of `tail`. Returns `true` iff the
    /// queue was empty, making this writer the leader.
    ///
    /// Observing the stall sentinel at the tail either fails the writer
    /// immediately (`no_slowdown`) or blocks it on the stall condvar
    /// until the sentinel is withdrawn.
    pub(crate) fn link_one(&self, idx: u32, tail: &AtomicU32) -> bool {
        let slot = self.pool.slot(idx);
        debug_assert_eq!(slot.state.load(Ordering::Relaxed), STATE_INIT);
        let mut tail_idx = tail.load(Ordering::Relaxed);
        loop {
            if tail_idx == STALL_SLOT && idx != STALL_SLOT {
                if slot.flag(FLAG_NO_SLOWDOWN) {
                    slot.payload.lock().status = Err(LoamError::WriteStall);
                    metrics::record_stall_rejection();
                    set_state(slot, STATE_COMPLETED);
                    tracing::debug!(
                        target: "loam.write.stall",
                        writer = idx,
                        "no_slowdown writer rejected by stall"
                    );
                    return false;
                }
                let mut guard = self.stall_mu.lock();
                tail_idx = tail.load(Ordering::Relaxed);
                if tail_idx == STALL_SLOT {
                    self.stall_cv.wait(&mut guard);
                    tail_idx = tail.load(Ordering::Relaxed);
                }
                continue;
            }
            slot.link_older.store(tail_idx, Ordering::Relaxed);
            match tail.compare_exchange_weak(tail_idx, idx, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return tail_idx == NIL,
                Err(actual) => tail_idx = actual,
            }
        }
    }

    /// Splice an already-formed group onto `tail` in one CAS. Members'
    /// forward links and group membership are cleared first so the next
    /// stage re-derives them. Returns `true` iff the group's leader became
    /// the head of the queue.
    pub(crate) fn link_group(&self, group: GroupToken, tail: &AtomicU32) -> bool {
        let header = &self.pool.slot(group.header).group;
        let leader = header.leader.load(Ordering::Relaxed);
        let last = header.last_writer.load(Ordering::Relaxed);

        let mut w = last;
        loop {
            let ws = self.pool.slot(w);
            ws.link_newer.store(NIL, Ordering::Relaxed);
            ws.write_group.store(NIL, Ordering::Relaxed);
            if w == leader {
                break;
            }
            w = ws.link_older.load(Ordering::Relaxed);
        }

        let mut newest = tail.load(Ordering::Relaxed);
        loop {
            self.pool
                .slot(leader)
                .link_older
                .store(newest, Ordering::Relaxed);
            match tail.compare_exchange_weak(newest, last, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return newest == NIL,
                Err(actual) => newest = actual,
            }
        }
    }

    /// Walk `link_older` from `head` toward the queue head, filling in
    /// missing `link_newer` pointers. Stops at the first writer already
    /// linked. Only a leader walks, so the fill cannot race.
    pub(crate) fn create_missing_newer_links(&self, head: u32) {
        let mut head = head;
        loop {
            if head == NIL {
                return;
            }
            let next = self.pool.slot(head).link_older.load(Ordering::Acquire);
            if next == NIL {
                return;
            }
            let next_slot = self.pool.slot(next);
            if next_slot.link_newer.load(Ordering::Acquire) != NIL {
                debug_assert_eq!(next_slot.link_newer.load(Ordering::Relaxed), head);
                return;
            }
            next_slot.link_newer.store(head, Ordering::Release);
            head = next;
        }
    }

    /// Locate the oldest writer strictly newer than `boundary`, starting
    /// from `from` (the observed tail).
    pub(crate) fn find_next_leader(&self, from: u32, boundary: u32) -> u32 {
        debug_assert!(from != NIL && from != boundary);
        let mut current = from;
        loop {
            let older = self.pool.slot(current).link_older.load(Ordering::Acquire);
            if older == boundary {
                return current;
            }
            debug_assert_ne!(older, NIL);
            current = older;
        }
    }

    // -----------------------------------------------------------------
    // Joining
    // -----------------------------------------------------------------

    /// Enqueue a batched writer and wait for a role. Returns the state
    /// that ended the wait: `GROUP_LEADER`, `MEMTABLE_WRITER_LEADER`,
    /// `PARALLEL_MEMTABLE_WRITER`, or `COMPLETED`.
    pub fn join_batch_group(&self, w: &WriterTicket) -> u8 {
        let slot = self.pool.slot(w.idx);
        debug_assert!(slot.flag(FLAG_HAS_BATCH));

        let linked_as_leader = self.link_one(w.idx, &self.newest_writer);
        if linked_as_leader {
            set_state(slot, STATE_GROUP_LEADER);
            tracing::trace!(target: "loam.write", writer = w.idx, "joined as leader");
            return STATE_GROUP_LEADER;
        }
        await_state(
            slot,
            STATE_GROUP_LEADER
                | STATE_MEMTABLE_WRITER_LEADER
                | STATE_PARALLEL_MEMTABLE_WRITER
                | STATE_COMPLETED,
            &JOIN_BATCH_GROUP_CTX,
            &self.policy,
        )
    }

    /// Wait on an arbitrary goal mask (test harnesses and external
    /// drivers; the pipeline's own waits use dedicated call sites).
    pub fn await_writer(&self, w: &WriterTicket, goal_mask: u8) -> u8 {
        await_state(
            self.pool.slot(w.idx),
            goal_mask,
            &AWAIT_WRITER_CTX,
            &self.policy,
        )
    }

    /// Current state bits of a writer.
    #[must_use]
    pub fn writer_state(&self, w: &WriterTicket) -> u8 {
        self.pool.slot(w.idx).state.load(Ordering::Acquire)
    }

    /// Sequence assigned to the writer's first operation.
    #[must_use]
    pub fn writer_sequence(&self, w: &WriterTicket) -> SequenceNumber {
        SequenceNumber(self.pool.slot(w.idx).sequence.load(Ordering::Acquire))
    }

    /// The group this writer currently belongs to.
    #[must_use]
    pub fn writer_group(&self, w: &WriterTicket) -> GroupToken {
        let header = self.pool.slot(w.idx).write_group.load(Ordering::Acquire);
        debug_assert_ne!(header, NIL);
        GroupToken { header }
    }

    /// Member count of a group.
    #[must_use]
    pub fn group_size(&self, group: GroupToken) -> usize {
        self.pool
            .slot(group.header)
            .group
            .size
            .load(Ordering::Acquire)
    }

    /// Sequence of the final operation committed by this group.
    #[must_use]
    pub fn group_last_sequence(&self, group: GroupToken) -> SequenceNumber {
        SequenceNumber(
            self.pool
                .slot(group.header)
                .group
                .last_sequence
                .load(Ordering::Acquire),
        )
    }

    // -----------------------------------------------------------------
    // Stall gate
    // -----------------------------------------------------------------

    /// Install the stall sentinel at the tail of the primary queue and
    /// fail any already-queued `no_slowdown` writers that no leader has
    /// claimed yet.
    ///
    /// Callers serialize `begin_write_stall`/`end_write_stall` through the
    /// engine's exclusive lock.
    pub fn begin_write_stall(&self) {
        let stall = self.pool.slot(STALL_SLOT);
        stall.reset();
        let _ = self.link_one(STALL_SLOT, &self.newest_writer);

        // Ungrouped writers sit between the sentinel and the head; a
        // group never mixes slowdown policies, so the walk can stop at
        // the first grouped writer.
        let mut prev = STALL_SLOT;
        let mut w = stall.link_older.load(Ordering::Acquire);
        while w != NIL && self.pool.slot(w).write_group.load(Ordering::Acquire) == NIL {
            let ws = self.pool.slot(w);
            if ws.flag(FLAG_NO_SLOWDOWN) {
                let older = ws.link_older.load(Ordering::Acquire);
                self.pool.slot(prev).link_older.store(older, Ordering::Release);
                ws.payload.lock().status = Err(LoamError::WriteStall);
                metrics::record_stall_rejection();
                set_state(ws, STATE_COMPLETED);
                w = older;
            } else {
                prev = w;
                w = ws.link_older.load(Ordering::Acquire);
            }
        }
        tracing::debug!(target: "loam.write.stall", "write stall installed");
    }

    /// Withdraw the stall sentinel and release every writer blocked on it.
    pub fn end_write_stall(&self) {
        let guard = self.stall_mu.lock();
        assert_eq!(
            self.newest_writer.load(Ordering::Relaxed),
            STALL_SLOT,
            "stall sentinel must be at the tail when the stall ends"
        );
        let stall = self.pool.slot(STALL_SLOT);
        let older = stall.link_older.load(Ordering::Relaxed);
        self.newest_writer.store(older, Ordering::Release);
        stall.link_older.store(NIL, Ordering::Relaxed);
        self.stall_cv.notify_all();
        drop(guard);
        tracing::debug!(target: "loam.write.stall", "write stall cleared");
    }

    /// Whether the primary queue currently carries the stall sentinel.
    #[must_use]
    pub fn stalled(&self) -> bool {
        self.newest_writer.load(Ordering::Acquire) == STALL_SLOT
    }

    // -----------------------------------------------------------------
    // Unbatched gate
    // -----------------------------------------------------------------

    /// Take exclusive, in-order possession of the commit position for an
    /// operation that cannot ride a batch (memtable switch, schema
    /// change). The caller must have released any engine-wide lock first
    /// and reacquire it after; see the pipeline's `exclusive` wrapper.
    pub fn enter_unbatched(&self, w: &WriterTicket) {
        let slot = self.pool.slot(w.idx);
        debug_assert!(!slot.flag(FLAG_HAS_BATCH));
        let linked_as_leader = self.link_one(w.idx, &self.newest_writer);
        if !linked_as_leader {
            // The departing leader cannot pick us as a follower (no
            // batch), so the next promotion is ours.
            await_state(slot, STATE_GROUP_LEADER, &ENTER_UNBATCHED_CTX, &self.policy);
        }
        if self.pipelined {
            self.wait_for_memtable_writers();
        }
    }

    /// Hand the commit position back, promoting the next leader if
    /// anyone queued behind us.
    pub fn exit_unbatched(&self, w: &WriterTicket) {
        let idx = w.idx;
        match self
            .newest_writer
            .compare_exchange(idx, NIL, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(actual) => {
                self.create_missing_newer_links(actual);
                let next_leader = self.pool.slot(idx).link_newer.load(Ordering::Acquire);
                debug_assert_ne!(next_leader, NIL);
                self.pool
                    .slot(next_leader)
                    .link_older
                    .store(NIL, Ordering::Release);
                set_state(self.pool.slot(next_leader), STATE_GROUP_LEADER);
            }
        }
    }

    /// Drain the memtable queue to quiescence (pipelined mode): park a
    /// private sentinel writer on it, wait to be elected its leader, then
    /// clear the tail.
    fn wait_for_memtable_writers(&self) {
        debug_assert!(self.pipelined);
        if self.newest_memtable_writer.load(Ordering::Acquire) == NIL {
            return;
        }
        let idx = self.pool.claim();
        if !self.link_one(idx, &self.newest_memtable_writer) {
            await_state(
                self.pool.slot(idx),
                STATE_MEMTABLE_WRITER_LEADER,
                &WAIT_FOR_MEMTABLE_CTX,
                &self.policy,
            );
        }
        self.newest_memtable_writer.store(NIL, Ordering::Release);
        self.pool.release(idx);
    }

    // -----------------------------------------------------------------
    // Shared helpers for the group logic (see group.rs)
    // -----------------------------------------------------------------

    #[inline]
    pub(crate) fn slot(&self, idx: u32) -> &WriterSlot {
        self.pool.slot(idx)
    }

    pub(crate) fn set_writer_status(&self, idx: u32, status: Result<()>) {
        self.pool.slot(idx).payload.lock().status = status;
    }

    /// Indices of the group's members, oldest first.
    pub(crate) fn group_member_indices(&self, group: GroupToken) -> Vec<u32> {
        let header = &self.pool.slot(group.header).group;
        let leader = header.leader.load(Ordering::Relaxed);
        let last = header.last_writer.load(Ordering::Relaxed);
        let mut members = Vec::with_capacity(header.size.load(Ordering::Relaxed));
        let mut w = leader;
        loop {
            members.push(w);
            if w == last {
                break;
            }
            w = self.pool.slot(w).link_newer.load(Ordering::Acquire);
            debug_assert_ne!(w, NIL);
        }
        members
    }

    pub(crate) fn dummy_slot_for_exit(&self) -> u32 {
        let dummy = self.pool.slot(DUMMY_SLOT);
        dummy.link_older.store(NIL, Ordering::Relaxed);
        dummy.link_newer.store(NIL, Ordering::Relaxed);
        DUMMY_SLOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn controller() -> WriteController {
        WriteController::new(&WriteConfig::default())
    }

    fn batch_of(n: usize) -> WriteBatch {
        let mut b = WriteBatch::new();
        for i in 0..n {
            b.put(format!("k{i}").into_bytes(), vec![0u8; 8]);
        }
        b
    }

    #[test]
    fn first_writer_links_as_leader() {
        let ctl = controller();
        let w = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        assert!(ctl.link_one(w.idx, &ctl.newest_writer));
        assert_eq!(ctl.newest_writer.load(Ordering::Relaxed), w.idx);
        assert_eq!(ctl.slot(w.idx).link_older.load(Ordering::Relaxed), NIL);
    }

    #[test]
    fn enqueue_order_is_link_older_order() {
        let ctl = controller();
        let a = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        let b = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        let c = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        assert!(ctl.link_one(a.idx, &ctl.newest_writer));
        assert!(!ctl.link_one(b.idx, &ctl.newest_writer));
        assert!(!ctl.link_one(c.idx, &ctl.newest_writer));
        assert_eq!(ctl.slot(c.idx).link_older.load(Ordering::Relaxed), b.idx);
        assert_eq!(ctl.slot(b.idx).link_older.load(Ordering::Relaxed), a.idx);
        assert_eq!(ctl.slot(a.idx).link_older.load(Ordering::Relaxed), NIL);
    }

    #[test]
    fn newer_links_materialize_from_tail() {
        let ctl = controller();
        let a = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        let b = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        let c = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        ctl.link_one(a.idx, &ctl.newest_writer);
        ctl.link_one(b.idx, &ctl.newest_writer);
        ctl.link_one(c.idx, &ctl.newest_writer);
        ctl.create_missing_newer_links(c.idx);
        assert_eq!(ctl.slot(a.idx).link_newer.load(Ordering::Relaxed), b.idx);
        assert_eq!(ctl.slot(b.idx).link_newer.load(Ordering::Relaxed), c.idx);
        assert_eq!(ctl.slot(c.idx).link_newer.load(Ordering::Relaxed), NIL);
        // Idempotent.
        ctl.create_missing_newer_links(c.idx);
        assert_eq!(ctl.slot(a.idx).link_newer.load(Ordering::Relaxed), b.idx);
    }

    #[test]
    fn stall_rejects_no_slowdown_on_arrival() {
        let ctl = controller();
        ctl.begin_write_stall();
        assert!(ctl.stalled());

        let opts = WriteOptions {
            no_slowdown: true,
            ..WriteOptions::default()
        };
        let w = ctl.register_writer(Some(batch_of(1)), &opts, None);
        assert!(!ctl.link_one(w.idx, &ctl.newest_writer));
        assert_eq!(ctl.writer_state(&w), STATE_COMPLETED);
        let (status, _) = ctl.finish_writer(w);
        assert_eq!(status, Err(LoamError::WriteStall));

        ctl.end_write_stall();
        assert!(!ctl.stalled());
    }

    #[test]
    fn stall_blocks_patient_writer_until_release() {
        let ctl = Arc::new(controller());
        ctl.begin_write_stall();

        let c = Arc::clone(&ctl);
        let blocked = thread::spawn(move || {
            let w = c.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
            let leader = c.link_one(w.idx, &c.newest_writer);
            (leader, w)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "writer must block while stalled");

        ctl.end_write_stall();
        let (leader, w) = blocked.join().unwrap();
        assert!(leader, "queue was empty behind the sentinel");
        assert_eq!(ctl.newest_writer.load(Ordering::Relaxed), w.idx);
    }

    #[test]
    fn begin_write_stall_purges_queued_no_slowdown_writers() {
        let ctl = controller();
        // Queue: keep (leader-to-be), reject, keep.
        let keep1 = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        let reject = ctl.register_writer(
            Some(batch_of(1)),
            &WriteOptions {
                no_slowdown: true,
                ..WriteOptions::default()
            },
            None,
        );
        let keep2 = ctl.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
        ctl.link_one(keep1.idx, &ctl.newest_writer);
        ctl.link_one(reject.idx, &ctl.newest_writer);
        ctl.link_one(keep2.idx, &ctl.newest_writer);

        ctl.begin_write_stall();

        assert_eq!(ctl.writer_state(&reject), STATE_COMPLETED);
        assert_eq!(ctl.writer_state(&keep1), STATE_INIT);
        assert_eq!(ctl.writer_state(&keep2), STATE_INIT);
        // The chain is patched around the rejected writer.
        assert_eq!(
            ctl.slot(keep2.idx).link_older.load(Ordering::Relaxed),
            keep1.idx
        );
        ctl.end_write_stall();
    }

    #[test]
    fn unbatched_excludes_other_leaders() {
        let ctl = Arc::new(controller());
        let u = ctl.register_writer(None, &WriteOptions::default(), None);
        ctl.enter_unbatched(&u);

        // A writer arriving now must not become leader.
        let c = Arc::clone(&ctl);
        let contender = thread::spawn(move || {
            let w = c.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
            let state = c.join_batch_group(&w);
            (state, w)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished(), "writer must wait behind the gate");

        ctl.exit_unbatched(&u);
        let (state, _w) = contender.join().unwrap();
        assert_eq!(state, STATE_GROUP_LEADER);
        ctl.finish_writer(u);
    }

    #[test]
    fn exit_unbatched_clears_empty_queue() {
        let ctl = controller();
        let u = ctl.register_writer(None, &WriteOptions::default(), None);
        ctl.enter_unbatched(&u);
        ctl.exit_unbatched(&u);
        assert_eq!(ctl.newest_writer.load(Ordering::Relaxed), NIL);
        ctl.finish_writer(u);
    }

    #[test]
    fn concurrent_link_one_elects_exactly_one_leader() {
        let ctl = Arc::new(controller());
        let threads = 8;
        let barrier = Arc::new(std::sync::Barrier::new(threads));
        let mut handles = Vec::new();
        for _ in 0..threads {
            let c = Arc::clone(&ctl);
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let w = c.register_writer(Some(batch_of(1)), &WriteOptions::default(), None);
                b.wait();
                c.link_one(w.idx, &c.newest_writer)
            }));
        }
        let leaders = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&l| l)
            .count();
        assert_eq!(leaders, 1, "exactly one writer may observe an empty tail");
    }
}
