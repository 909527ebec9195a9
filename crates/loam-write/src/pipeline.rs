//! The commit pipeline: drives a writer through the coordinator's state
//! machine against concrete WAL and memtable collaborators.
//!
//! [`CommitPipeline::submit`] is the caller-facing surface. The calling
//! thread executes whatever role the coordinator elects it into: a leader
//! assembles the group, assigns sequences, writes the group's WAL records
//! and either applies every batch itself or releases the group for
//! parallel insertion; a follower returns once its leader (or the last
//! parallel writer out) completes it.
//!
//! Sequence accounting distinguishes *allocated* from *visible*: the WAL
//! stage allocates, and the sequence becomes visible to readers only after
//! the group's batches have reached the memtable. Readers that snapshot
//! `last_visible_sequence` therefore never observe a sequence whose
//! effects are still in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loam_error::Result;
use loam_types::{SequenceNumber, WriteBatch, WriteConfig, WriteOptions};

use crate::controller::{GroupToken, WriteController, WriterTicket};
use crate::metrics;
use crate::sink::{MemtableSink, WalRecord, WalSink, WriteCallback};
use crate::slot::{
    FLAG_DISABLE_MEMTABLE, FLAG_DISABLE_WAL, FLAG_HAS_BATCH, FLAG_HAS_MERGE, FLAG_SYNC,
    STATE_COMPLETED, STATE_GROUP_LEADER, STATE_MEMTABLE_WRITER_LEADER,
    STATE_PARALLEL_MEMTABLE_WRITER,
};

/// Group-commit pipeline binding the coordinator to its collaborators.
pub struct CommitPipeline<W: WalSink, M: MemtableSink> {
    controller: WriteController,
    wal: Arc<W>,
    memtable: Arc<M>,
    /// Highest sequence handed out by the WAL stage.
    last_allocated_sequence: AtomicU64,
    /// Highest sequence whose memtable effects are readable.
    last_visible_sequence: AtomicU64,
}

impl<W: WalSink, M: MemtableSink> CommitPipeline<W, M> {
    /// Build a pipeline resuming after `last_sequence` (zero for a fresh
    /// database).
    pub fn new(
        config: &WriteConfig,
        wal: Arc<W>,
        memtable: Arc<M>,
        last_sequence: SequenceNumber,
    ) -> Self {
        Self {
            controller: WriteController::new(config),
            wal,
            memtable,
            last_allocated_sequence: AtomicU64::new(last_sequence.get()),
            last_visible_sequence: AtomicU64::new(last_sequence.get()),
        }
    }

    /// The underlying coordinator (stall control, diagnostics, tests).
    #[must_use]
    pub fn controller(&self) -> &WriteController {
        &self.controller
    }

    /// Highest sequence whose effects are readable.
    #[must_use]
    pub fn last_visible_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.last_visible_sequence.load(Ordering::Acquire))
    }

    /// Highest sequence allocated by the WAL stage.
    #[must_use]
    pub fn last_allocated_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.last_allocated_sequence.load(Ordering::Acquire))
    }

    /// Install write back-pressure (see the stall gate).
    pub fn begin_write_stall(&self) {
        self.controller.begin_write_stall();
    }

    /// Release write back-pressure.
    pub fn end_write_stall(&self) {
        self.controller.end_write_stall();
    }

    /// Commit one batch, blocking until it is ordered, logged, and
    /// applied. Returns the sequence of the batch's first operation.
    pub fn submit(&self, batch: WriteBatch, opts: &WriteOptions) -> Result<SequenceNumber> {
        self.submit_with_callback(batch, opts, None)
    }

    /// [`submit`](Self::submit) with a pre-commit callback attached.
    pub fn submit_with_callback(
        &self,
        batch: WriteBatch,
        opts: &WriteOptions,
        callback: Option<Box<dyn WriteCallback>>,
    ) -> Result<SequenceNumber> {
        let ticket = self.controller.register_writer(Some(batch), opts, callback);

        if self.controller.pipelined() {
            let mut state = self.controller.join_batch_group(&ticket);
            if state == STATE_GROUP_LEADER {
                self.lead_wal_stage(&ticket);
                state = self.controller.writer_state(&ticket);
            }
            if state == STATE_MEMTABLE_WRITER_LEADER {
                self.lead_memtable_stage(&ticket);
                state = self.controller.writer_state(&ticket);
            }
            if state == STATE_PARALLEL_MEMTABLE_WRITER {
                self.parallel_memtable_write(&ticket);
            }
        } else {
            match self.controller.join_batch_group(&ticket) {
                STATE_GROUP_LEADER => self.lead_unified(&ticket),
                STATE_PARALLEL_MEMTABLE_WRITER => self.parallel_memtable_write(&ticket),
                STATE_COMPLETED => {}
                other => unreachable!("writer emerged from join in state {other:#b}"),
            }
        }

        let (status, sequence) = self.controller.finish_writer(ticket);
        status.map(|()| sequence)
    }

    /// Run `f` with exclusive, in-order possession of the commit
    /// position: no group forms and, in pipelined mode, the memtable
    /// queue is drained first. The engine-wide lock, if any, must be
    /// released around this call.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let ticket = self
            .controller
            .register_writer(None, &WriteOptions::default(), None);
        self.controller.enter_unbatched(&ticket);
        let result = f();
        self.controller.exit_unbatched(&ticket);
        self.controller.finish_writer(ticket);
        result
    }

    // -----------------------------------------------------------------
    // Leader roles
    // -----------------------------------------------------------------

    fn lead_unified(&self, leader: &WriterTicket) {
        let (group, _bytes) = self.controller.enter_as_batch_group_leader(leader);

        let mut status = self.run_pre_commits(group);
        if status.is_ok() {
            self.assign_sequences(group);
            status = self.write_wal(group);
        }
        if status.is_err() {
            self.controller.set_writer_status(leader.idx, status.clone());
            self.controller.exit_as_batch_group_leader(group, status);
            return;
        }

        if self.parallel_group(group) {
            self.controller.launch_parallel_memtable_writers(group);
            self.parallel_memtable_write(leader);
        } else {
            let status = self.insert_group_serial(group);
            self.controller.set_writer_status(leader.idx, status.clone());
            self.publish_visible(group);
            self.controller.exit_as_batch_group_leader(group, status);
        }
    }

    fn lead_wal_stage(&self, leader: &WriterTicket) {
        let (group, _bytes) = self.controller.enter_as_batch_group_leader(leader);

        let mut status = self.run_pre_commits(group);
        if status.is_ok() {
            self.assign_sequences(group);
            status = self.write_wal(group);
        }
        self.controller.set_writer_status(leader.idx, status.clone());
        self.controller.exit_as_batch_group_leader(group, status);
    }

    fn lead_memtable_stage(&self, leader: &WriterTicket) {
        let group = self.controller.enter_as_memtable_writer(leader);

        if self.controller.group_size(group) > 1
            && self.controller.allow_concurrent_memtable_write()
        {
            self.controller.launch_parallel_memtable_writers(group);
            // This thread continues as one of the parallel writers.
            return;
        }

        let status = self.insert_group_serial(group);
        if let Err(err) = status {
            *self.controller.slot(group.header).group.status.lock() = Err(err);
        }
        self.publish_visible(group);
        self.controller.exit_as_memtable_writer(group);
    }

    /// Insert this writer's own batch, then take part in the group's
    /// last-one-out completion.
    fn parallel_memtable_write(&self, w: &WriterTicket) {
        self.insert_own(w);
        let group = self.controller.writer_group(w);
        if self.controller.complete_parallel_memtable_writer(w) {
            self.publish_visible(group);
            if self.controller.pipelined() {
                self.controller.exit_as_memtable_writer(group);
            } else if group.header == w.idx {
                // The leader finished last and closes its own group.
                let status = self.controller.slot(w.idx).payload.lock().status.clone();
                self.controller.exit_as_batch_group_leader(group, status);
            } else {
                self.controller.exit_as_batch_group_follower(w);
            }
        } else if group.header == w.idx {
            // A leader completed by another writer adopts the group's
            // verdict; followers receive theirs from the exit walk.
            let aggregate = self.controller.slot(w.idx).group.status.lock().clone();
            if aggregate.is_err() {
                let mut payload = self.controller.slot(w.idx).payload.lock();
                if payload.status.is_ok() {
                    payload.status = aggregate;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Stage work
    // -----------------------------------------------------------------

    fn run_pre_commits(&self, group: GroupToken) -> Result<()> {
        for idx in self.controller.group_member_indices(group) {
            let payload = self.controller.slot(idx).payload.lock();
            if let Some(cb) = payload.callback.as_ref() {
                cb.pre_commit()?;
            }
        }
        Ok(())
    }

    /// Hand out sequence numbers in enqueue order. Only the WAL-stage
    /// leader allocates, and leadership is serialized, so plain
    /// load/store suffices.
    fn assign_sequences(&self, group: GroupToken) {
        let mut seq = self.last_allocated_sequence.load(Ordering::Relaxed);
        for idx in self.controller.group_member_indices(group) {
            let slot = self.controller.slot(idx);
            slot.sequence.store(seq + 1, Ordering::Release);
            seq += slot.batch_count.load(Ordering::Relaxed);
        }
        self.last_allocated_sequence.store(seq, Ordering::Release);
        self.controller
            .slot(group.header)
            .group
            .last_sequence
            .store(seq, Ordering::Release);
    }

    fn write_wal(&self, group: GroupToken) -> Result<()> {
        let sync = self.controller.slot(group.header).flag(FLAG_SYNC);

        let mut sequences = Vec::new();
        let mut guards = Vec::new();
        for idx in self.controller.group_member_indices(group) {
            let slot = self.controller.slot(idx);
            if slot.flag(FLAG_HAS_BATCH) && !slot.flag(FLAG_DISABLE_WAL) {
                sequences.push(SequenceNumber(slot.sequence.load(Ordering::Relaxed)));
                guards.push(slot.payload.lock());
            }
        }
        let records: Vec<WalRecord<'_>> = guards
            .iter()
            .zip(&sequences)
            .filter_map(|(payload, &sequence)| {
                payload
                    .batch
                    .as_ref()
                    .map(|batch| WalRecord { sequence, batch })
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        let result = self.wal.write_records(&records, sync);
        match &result {
            Ok(()) => {
                metrics::record_wal_group();
                tracing::info!(
                    target: "loam.write",
                    records = records.len(),
                    sync,
                    first_sequence = records[0].sequence.get(),
                    "wal group written"
                );
            }
            Err(err) => {
                tracing::warn!(target: "loam.write", %err, "wal group write failed");
            }
        }
        result
    }

    /// Whether the group may fan out across its members' threads.
    fn parallel_group(&self, group: GroupToken) -> bool {
        if !self.controller.allow_concurrent_memtable_write() {
            return false;
        }
        let members = self.controller.group_member_indices(group);
        if members.len() <= 1 {
            return false;
        }
        // Merges read their operand's current value; they only run from a
        // serial context.
        members
            .iter()
            .all(|&idx| !self.controller.slot(idx).flag(FLAG_HAS_MERGE))
    }

    fn insert_own(&self, w: &WriterTicket) {
        let slot = self.controller.slot(w.idx);
        if !slot.flag(FLAG_HAS_BATCH) || slot.flag(FLAG_DISABLE_MEMTABLE) {
            return;
        }
        let sequence = SequenceNumber(slot.sequence.load(Ordering::Acquire));
        let mut payload = slot.payload.lock();
        let result = match payload.batch.as_ref() {
            Some(batch) => self.memtable.insert(batch, sequence),
            None => Ok(()),
        };
        if let Err(err) = result {
            payload.status = Err(err);
        }
    }

    fn insert_group_serial(&self, group: GroupToken) -> Result<()> {
        for idx in self.controller.group_member_indices(group) {
            let slot = self.controller.slot(idx);
            if !slot.flag(FLAG_HAS_BATCH) || slot.flag(FLAG_DISABLE_MEMTABLE) {
                continue;
            }
            let sequence = SequenceNumber(slot.sequence.load(Ordering::Relaxed));
            let payload = slot.payload.lock();
            if let Some(batch) = payload.batch.as_ref() {
                self.memtable.insert(batch, sequence)?;
            }
        }
        Ok(())
    }

    fn publish_visible(&self, group: GroupToken) {
        let last = self
            .controller
            .slot(group.header)
            .group
            .last_sequence
            .load(Ordering::Acquire);
        self.last_visible_sequence.fetch_max(last, Ordering::AcqRel);
    }
}
