//! Contracts toward the coordinator's collaborators.
//!
//! The coordinator orders and groups writes; durability and lookup belong
//! to the WAL writer and the memtable behind these traits. Only the
//! WAL-stage leader calls [`WalSink::write_records`]; every writer in a
//! parallel group calls [`MemtableSink::insert`] for its own batch.

use loam_error::Result;
use loam_types::{SequenceNumber, WriteBatch};

/// One group member's contribution to a WAL group write.
#[derive(Debug, Clone, Copy)]
pub struct WalRecord<'a> {
    /// Sequence assigned to the batch's first operation.
    pub sequence: SequenceNumber,
    /// The batch payload to serialize.
    pub batch: &'a WriteBatch,
}

/// The write-ahead log writer.
pub trait WalSink: Send + Sync {
    /// Serialize and persist one group's records in order; make them
    /// durable before returning iff `sync`.
    fn write_records(&self, records: &[WalRecord<'_>], sync: bool) -> Result<()>;
}

/// The in-memory table.
pub trait MemtableSink: Send + Sync {
    /// Apply a batch starting at `sequence`. Must tolerate concurrent
    /// calls for distinct batches; merge batches are only ever applied
    /// from a serial context.
    fn insert(&self, batch: &WriteBatch, sequence: SequenceNumber) -> Result<()>;
}

/// Optional per-write hook consulted by the coordinator.
pub trait WriteCallback: Send + Sync {
    /// Whether this write may share a group with others. Queried once at
    /// enqueue; must be pure.
    fn allow_batching(&self) -> bool {
        true
    }

    /// Runs on the leader after grouping and before any WAL work. A
    /// failure fails the whole group.
    fn pre_commit(&self) -> Result<()> {
        Ok(())
    }
}
