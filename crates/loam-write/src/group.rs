//! Group assembly and the stage exit protocols.
//!
//! A leader assembles a maximal run of compatible writers behind it, does
//! the stage's work on their behalf, and on exit promotes whichever writer
//! became the new head. In pipelined mode the WAL-stage exit additionally
//! splices the surviving group onto the memtable queue and elects the next
//! WAL leader with a parked boundary marker, so neither stage idles while
//! work is waiting.
//!
//! Completion order is load-bearing throughout: a departing leader reads a
//! writer's links *before* publishing `COMPLETED`, because the moment that
//! state lands the writer's submitter may return and the slot be recycled.

use std::sync::atomic::Ordering;

use loam_error::Result;

use crate::controller::{GroupToken, WriteController, WriterTicket};
use crate::metrics;
use crate::slot::{
    FLAG_DISABLE_MEMTABLE, FLAG_ALLOW_BATCHING, FLAG_DISABLE_WAL, FLAG_HAS_BATCH, FLAG_HAS_MERGE,
    FLAG_NO_SLOWDOWN, FLAG_SYNC, NIL, STATE_COMPLETED, STATE_GROUP_LEADER,
    STATE_MEMTABLE_WRITER_LEADER, STATE_PARALLEL_MEMTABLE_WRITER, WriterSlot,
};
use crate::wait::{await_state, set_state, AdaptationContext};

static EXIT_GROUP_LEADER_CTX: AdaptationContext =
    AdaptationContext::new("exit_as_batch_group_leader");
static COMPLETE_PARALLEL_CTX: AdaptationContext =
    AdaptationContext::new("complete_parallel_memtable_writer");

/// Hard ceiling on a group's combined batch bytes.
const MAX_WRITE_GROUP_BYTES: usize = 1 << 20;
/// Growth allowance past the leader's own size, and the leader size above
/// which the hard ceiling applies instead.
const GROUP_EXTENSION_BYTES: usize = 128 << 10;

fn group_max_size(leader_bytes: usize) -> usize {
    // A small leading write is not held hostage by a megabyte of
    // followers; it may grow only by the fixed allowance.
    if leader_bytes <= GROUP_EXTENSION_BYTES {
        leader_bytes + GROUP_EXTENSION_BYTES
    } else {
        MAX_WRITE_GROUP_BYTES
    }
}

fn should_write_to_memtable(slot: &WriterSlot) -> bool {
    slot.flag(FLAG_HAS_BATCH) && !slot.flag(FLAG_DISABLE_MEMTABLE)
}

impl WriteController {
    // -----------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------

    /// Assemble the WAL-stage group: starting at `leader`, admit newer
    /// writers while the flag and size rules hold. Returns the group and
    /// its combined batch bytes.
    pub fn enter_as_batch_group_leader(&self, leader: &WriterTicket) -> (GroupToken, usize) {
        let lidx = leader.idx;
        let lslot = self.slot(lidx);
        debug_assert_eq!(lslot.link_older.load(Ordering::Relaxed), NIL);
        debug_assert!(lslot.flag(FLAG_HAS_BATCH));
        debug_assert_eq!(lslot.state.load(Ordering::Relaxed), STATE_GROUP_LEADER);

        let mut size = lslot.batch_size.load(Ordering::Relaxed) as usize;
        let max_size = group_max_size(size);

        let header = &lslot.group;
        header.leader.store(lidx, Ordering::Relaxed);
        header.last_writer.store(lidx, Ordering::Relaxed);
        header.size.store(1, Ordering::Relaxed);
        header.running.store(0, Ordering::Relaxed);
        header.last_sequence.store(0, Ordering::Relaxed);
        *header.status.lock() = Ok(());
        lslot.write_group.store(lidx, Ordering::Release);

        let newest = self.newest_writer.load(Ordering::Acquire);
        self.create_missing_newer_links(newest);

        let lflags = lslot.flags.load(Ordering::Relaxed);
        let mut w = lidx;
        while w != newest {
            let next = self.slot(w).link_newer.load(Ordering::Acquire);
            debug_assert_ne!(next, NIL);
            w = next;
            let ws = self.slot(w);
            let wf = ws.flags.load(Ordering::Relaxed);

            if (wf ^ lflags) & FLAG_SYNC != 0 {
                // Sync and non-sync writes never share a WAL commit.
                break;
            }
            if (wf ^ lflags) & FLAG_NO_SLOWDOWN != 0 {
                // Writers that fail on delay do not mix with writers that
                // tolerate it.
                break;
            }
            if wf & FLAG_DISABLE_WAL == 0 && lflags & FLAG_DISABLE_WAL != 0 {
                // A WAL-needing write cannot ride a WAL-disabled commit.
                break;
            }
            if wf & FLAG_HAS_BATCH == 0 {
                // Not a write: the stall sentinel or an unbatched
                // exclusive operation. It wants the position to itself.
                break;
            }
            if wf & FLAG_ALLOW_BATCHING == 0 {
                break;
            }
            let batch_size = ws.batch_size.load(Ordering::Relaxed) as usize;
            if size + batch_size > max_size {
                break;
            }

            ws.write_group.store(lidx, Ordering::Release);
            size += batch_size;
            header.last_writer.store(w, Ordering::Relaxed);
            header.size.fetch_add(1, Ordering::Relaxed);
        }

        let group_size = header.size.load(Ordering::Relaxed);
        metrics::record_group_formed(group_size);
        tracing::debug!(
            target: "loam.write",
            leader = lidx,
            members = group_size,
            bytes = size,
            "wal group assembled"
        );
        (GroupToken { header: lidx }, size)
    }

    /// Assemble the memtable-stage group (pipelined mode). The WAL-stage
    /// mixing rules no longer apply; the group instead terminates at any
    /// batch carrying a merge, which cannot run against concurrent
    /// inserters.
    pub fn enter_as_memtable_writer(&self, leader: &WriterTicket) -> GroupToken {
        let lidx = leader.idx;
        let lslot = self.slot(lidx);
        debug_assert_eq!(lslot.link_older.load(Ordering::Relaxed), NIL);
        debug_assert!(lslot.flag(FLAG_HAS_BATCH));

        let mut size = lslot.batch_size.load(Ordering::Relaxed) as usize;
        let max_size = group_max_size(size);

        let header = &lslot.group;
        header.leader.store(lidx, Ordering::Relaxed);
        header.last_writer.store(lidx, Ordering::Relaxed);
        header.size.store(1, Ordering::Relaxed);
        header.running.store(0, Ordering::Relaxed);
        *header.status.lock() = Ok(());
        lslot.write_group.store(lidx, Ordering::Release);

        let mut last_writer = lidx;
        if !self.allow_concurrent_memtable_write || !lslot.flag(FLAG_HAS_MERGE) {
            let newest = self.newest_memtable_writer.load(Ordering::Acquire);
            self.create_missing_newer_links(newest);

            let mut w = lidx;
            while w != newest {
                let next = self.slot(w).link_newer.load(Ordering::Acquire);
                debug_assert_ne!(next, NIL);
                w = next;
                let ws = self.slot(w);

                if !ws.flag(FLAG_HAS_BATCH) {
                    break;
                }
                if ws.flag(FLAG_HAS_MERGE) {
                    break;
                }
                if !self.allow_concurrent_memtable_write {
                    // The leader applies everything itself; keep the
                    // serial pass bounded like a WAL group.
                    let batch_size = ws.batch_size.load(Ordering::Relaxed) as usize;
                    if size + batch_size > max_size {
                        break;
                    }
                    size += batch_size;
                }

                ws.write_group.store(lidx, Ordering::Release);
                last_writer = w;
                header.size.fetch_add(1, Ordering::Relaxed);
            }
        }

        header.last_writer.store(last_writer, Ordering::Relaxed);
        let last_slot = self.slot(last_writer);
        let last_sequence = last_slot.sequence.load(Ordering::Acquire)
            + last_slot.batch_count.load(Ordering::Relaxed)
            - 1;
        header.last_sequence.store(last_sequence, Ordering::Relaxed);

        tracing::debug!(
            target: "loam.write",
            leader = lidx,
            members = header.size.load(Ordering::Relaxed),
            last_sequence,
            "memtable group assembled"
        );
        GroupToken { header: lidx }
    }

    // -----------------------------------------------------------------
    // Parallel memtable phase
    // -----------------------------------------------------------------

    /// Release every member of the group to insert its own batch. The
    /// `running` count is published before any state flips so the first
    /// finisher cannot observe it missing.
    pub fn launch_parallel_memtable_writers(&self, group: GroupToken) {
        let header = &self.slot(group.header).group;
        header
            .running
            .store(header.size.load(Ordering::Relaxed), Ordering::Release);
        metrics::record_parallel_launch();

        let leader = header.leader.load(Ordering::Relaxed);
        let last = header.last_writer.load(Ordering::Relaxed);
        let mut w = leader;
        loop {
            let ws = self.slot(w);
            let next = ws.link_newer.load(Ordering::Acquire);
            set_state(ws, STATE_PARALLEL_MEMTABLE_WRITER);
            if w == last {
                break;
            }
            w = next;
        }
    }

    /// Report one member's memtable insertion done. Returns `true` for
    /// the last writer out, which must then drive the group exit; every
    /// other writer waits here until the exit completes it.
    pub fn complete_parallel_memtable_writer(&self, w: &WriterTicket) -> bool {
        let ws = self.slot(w.idx);
        let header_idx = ws.write_group.load(Ordering::Acquire);
        debug_assert_ne!(header_idx, NIL);
        let header = &self.slot(header_idx).group;

        let my_status = ws.payload.lock().status.clone();
        if let Err(err) = my_status {
            // The one place a follower writes into leader-owned storage.
            *header.status.lock() = Err(err);
        }

        if header.running.fetch_sub(1, Ordering::AcqRel) > 1 {
            await_state(ws, STATE_COMPLETED, &COMPLETE_PARALLEL_CTX, &self.policy);
            return false;
        }
        // Last one out carries the aggregate verdict.
        let aggregate = header.status.lock().clone();
        ws.payload.lock().status = aggregate;
        true
    }

    /// Unified-mode counterpart of the leader exit, run by a follower
    /// that was the last parallel writer out.
    pub fn exit_as_batch_group_follower(&self, w: &WriterTicket) {
        let ws = self.slot(w.idx);
        debug_assert_eq!(
            ws.state.load(Ordering::Relaxed),
            STATE_PARALLEL_MEMTABLE_WRITER
        );
        let header_idx = ws.write_group.load(Ordering::Acquire);
        let header = &self.slot(header_idx).group;
        let leader = header.leader.load(Ordering::Relaxed);

        let status = ws.payload.lock().status.clone();
        self.exit_as_batch_group_leader(GroupToken { header: header_idx }, status);
        set_state(self.slot(leader), STATE_COMPLETED);
    }

    // -----------------------------------------------------------------
    // Stage exits
    // -----------------------------------------------------------------

    /// Close the WAL-stage group: propagate `status`, promote the next
    /// leader, and in pipelined mode hand the group to the memtable
    /// queue before waiting for this writer's next role.
    pub fn exit_as_batch_group_leader(&self, group: GroupToken, status: Result<()>) {
        let header_slot = self.slot(group.header);
        let header = &header_slot.group;
        let leader = header.leader.load(Ordering::Relaxed);
        let last = header.last_writer.load(Ordering::Relaxed);
        debug_assert_eq!(self.slot(leader).link_older.load(Ordering::Relaxed), NIL);

        let mut status = status;
        if status.is_ok() {
            let group_status = header.status.lock().clone();
            if group_status.is_err() {
                status = group_status;
            }
        }

        if self.pipelined {
            // Writers whose batches stop at the WAL are done now; if the
            // stage failed, nobody proceeds to the memtable. They are
            // detached here but their COMPLETED is published only after
            // the tail handoff below: a completed writer's slot can be
            // recycled at once, and the tail CAS must not meet a recycled
            // index while it still expects the old occupant.
            let mut retired = Vec::new();
            let mut w = last;
            while w != leader {
                let ws = self.slot(w);
                let next = ws.link_older.load(Ordering::Acquire);
                ws.payload.lock().status = status.clone();
                if status.is_err() || !should_write_to_memtable(ws) {
                    self.detach_follower(w, group);
                    retired.push(w);
                }
                w = next;
            }
            if status.is_err() || !should_write_to_memtable(self.slot(leader)) {
                self.complete_leader(group);
            }

            // Decide the next WAL leader at exit time: park the boundary
            // marker at the tail; a failed CAS means writers arrived
            // during this commit.
            let mut next_leader = NIL;
            let dummy = self.dummy_slot_for_exit();
            let mut has_dummy = false;
            match self
                .newest_writer
                .compare_exchange(last, dummy, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => has_dummy = true,
                Err(actual) => next_leader = self.find_next_leader(actual, last),
            }

            // The group must reach the memtable queue before the next WAL
            // leader runs, or it could splice its own group ahead of ours.
            if header.size.load(Ordering::Relaxed) > 0 {
                if self.link_group(group, &self.newest_memtable_writer) {
                    set_state(
                        self.slot(header.leader.load(Ordering::Relaxed)),
                        STATE_MEMTABLE_WRITER_LEADER,
                    );
                }
            }

            if has_dummy {
                debug_assert_eq!(next_leader, NIL);
                match self
                    .newest_writer
                    .compare_exchange(dummy, NIL, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {}
                    Err(actual) => next_leader = self.find_next_leader(actual, dummy),
                }
            }

            if next_leader != NIL {
                let ns = self.slot(next_leader);
                ns.link_older.store(NIL, Ordering::Release);
                set_state(ns, STATE_GROUP_LEADER);
            }

            for w in retired {
                set_state(self.slot(w), STATE_COMPLETED);
            }

            await_state(
                header_slot,
                STATE_MEMTABLE_WRITER_LEADER | STATE_PARALLEL_MEMTABLE_WRITER | STATE_COMPLETED,
                &EXIT_GROUP_LEADER_CTX,
                &self.policy,
            );
        } else {
            let mut head = self.newest_writer.load(Ordering::Acquire);
            let mut detached = head == last;
            if detached {
                if let Err(actual) =
                    self.newest_writer
                        .compare_exchange(last, NIL, Ordering::AcqRel, Ordering::Acquire)
                {
                    // Somebody enqueued between the load and the CAS. No
                    // retry: only a departing leader removes nodes, and
                    // that is us.
                    head = actual;
                    detached = false;
                }
            }
            if !detached {
                debug_assert_ne!(head, last);
                // Writers arrived during this commit; the oldest of them
                // is the next leader and its wait ends here.
                self.create_missing_newer_links(head);
                let next_leader = self.slot(last).link_newer.load(Ordering::Acquire);
                debug_assert_ne!(next_leader, NIL);
                self.slot(next_leader).link_older.store(NIL, Ordering::Release);
                set_state(self.slot(next_leader), STATE_GROUP_LEADER);
            }

            // Complete newest-to-oldest, reading each link before the
            // state flip publishes the slot back to its submitter.
            let mut w = last;
            while w != leader {
                let ws = self.slot(w);
                ws.payload.lock().status = status.clone();
                let next = ws.link_older.load(Ordering::Acquire);
                set_state(ws, STATE_COMPLETED);
                w = next;
            }
        }
    }

    /// Close the memtable-stage group: promote the next memtable leader
    /// if more work queued, propagate the aggregate status, complete the
    /// followers, and complete the leader last — it owns the header.
    pub fn exit_as_memtable_writer(&self, group: GroupToken) {
        let header = &self.slot(group.header).group;
        let leader = header.leader.load(Ordering::Relaxed);
        let last = header.last_writer.load(Ordering::Relaxed);

        match self.newest_memtable_writer.compare_exchange(
            last,
            NIL,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(actual) => {
                self.create_missing_newer_links(actual);
                let next_leader = self.slot(last).link_newer.load(Ordering::Acquire);
                debug_assert_ne!(next_leader, NIL);
                self.slot(next_leader).link_older.store(NIL, Ordering::Release);
                set_state(self.slot(next_leader), STATE_MEMTABLE_WRITER_LEADER);
            }
        }

        let status = header.status.lock().clone();
        let mut w = leader;
        loop {
            let ws = self.slot(w);
            if status.is_err() {
                ws.payload.lock().status = status.clone();
            }
            let next = ws.link_newer.load(Ordering::Acquire);
            if w != leader {
                set_state(ws, STATE_COMPLETED);
            }
            if w == last {
                break;
            }
            w = next;
        }
        set_state(self.slot(leader), STATE_COMPLETED);
    }

    // -----------------------------------------------------------------
    // Early completion (pipelined WAL exit)
    // -----------------------------------------------------------------

    /// Retire the group's current leader, shifting leadership to its
    /// newer neighbor.
    pub(crate) fn complete_leader(&self, group: GroupToken) {
        let header = &self.slot(group.header).group;
        debug_assert!(header.size.load(Ordering::Relaxed) > 0);
        let leader = header.leader.load(Ordering::Relaxed);
        let lslot = self.slot(leader);

        if header.size.load(Ordering::Relaxed) == 1 {
            header.leader.store(NIL, Ordering::Relaxed);
            header.last_writer.store(NIL, Ordering::Relaxed);
        } else {
            let newer = lslot.link_newer.load(Ordering::Acquire);
            debug_assert_ne!(newer, NIL);
            self.slot(newer).link_older.store(NIL, Ordering::Release);
            header.leader.store(newer, Ordering::Relaxed);
        }
        header.size.fetch_sub(1, Ordering::Relaxed);
        set_state(lslot, STATE_COMPLETED);
    }

    /// Remove a non-leader member from the group chain without yet
    /// publishing its completion.
    pub(crate) fn detach_follower(&self, w: u32, group: GroupToken) {
        let header = &self.slot(group.header).group;
        debug_assert!(header.size.load(Ordering::Relaxed) > 1);
        debug_assert_ne!(w, header.leader.load(Ordering::Relaxed));
        let ws = self.slot(w);

        if w == header.last_writer.load(Ordering::Relaxed) {
            let older = ws.link_older.load(Ordering::Acquire);
            self.slot(older).link_newer.store(NIL, Ordering::Release);
            header.last_writer.store(older, Ordering::Relaxed);
        } else {
            let older = ws.link_older.load(Ordering::Acquire);
            let newer = ws.link_newer.load(Ordering::Acquire);
            self.slot(older).link_newer.store(newer, Ordering::Release);
            self.slot(newer).link_older.store(older, Ordering::Release);
        }
        header.size.fetch_sub(1, Ordering::Relaxed);
    }
}
