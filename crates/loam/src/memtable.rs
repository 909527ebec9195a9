//! Skiplist memtable.
//!
//! Entries are keyed by `(user_key, sequence)` with sequences ordered
//! newest-first, so a point lookup at a snapshot is a single range probe:
//! seek to `(key, snapshot)` and the first hit is the newest version at or
//! below the snapshot. The skiplist tolerates fully concurrent inserts,
//! which is what lets a write group fan its batches out across member
//! threads.
//!
//! Merge operands are resolved at insert time with the engine's append
//! operator (comma-joined, the classic string-append semantics). A merge
//! reads the key's current newest value, which is only sound from a
//! serial context — the write path never schedules a merge-carrying batch
//! into a concurrent group.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use loam_error::Result;
use loam_types::{BatchOp, SequenceNumber, WriteBatch};
use loam_write::MemtableSink;

/// Composite key: user key ascending, sequence descending.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InternalKey {
    user_key: Vec<u8>,
    sequence: u64,
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Put(Vec<u8>),
    Tombstone,
}

/// Outcome of a point lookup at a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The newest visible version is a live value.
    Value(Vec<u8>),
    /// The newest visible version is a deletion.
    Tombstone,
    /// No version of the key is visible.
    Miss,
}

/// A concurrent-insert memtable.
pub struct Memtable {
    entries: SkipMap<InternalKey, Value>,
    approximate_bytes: AtomicUsize,
}

impl Memtable {
    /// Create an empty memtable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            approximate_bytes: AtomicUsize::new(0),
        }
    }

    /// Apply one batch starting at `sequence`; operation `i` lands at
    /// `sequence + i`.
    pub fn apply(&self, batch: &WriteBatch, sequence: SequenceNumber) -> Result<()> {
        let mut seq = sequence.get();
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    self.insert_version(key.clone(), seq, Value::Put(value.clone()));
                }
                BatchOp::Delete { key } => {
                    self.insert_version(key.clone(), seq, Value::Tombstone);
                }
                BatchOp::Merge { key, operand } => {
                    let merged = match self.get(key, SequenceNumber(u64::MAX)) {
                        Lookup::Value(mut existing) => {
                            existing.push(b',');
                            existing.extend_from_slice(operand);
                            existing
                        }
                        Lookup::Tombstone | Lookup::Miss => operand.clone(),
                    };
                    self.insert_version(key.clone(), seq, Value::Put(merged));
                }
            }
            seq += 1;
        }
        Ok(())
    }

    fn insert_version(&self, user_key: Vec<u8>, sequence: u64, value: Value) {
        let bytes = user_key.len()
            + match &value {
                Value::Put(v) => v.len(),
                Value::Tombstone => 0,
            }
            + std::mem::size_of::<InternalKey>();
        self.entries
            .insert(InternalKey { user_key, sequence }, value);
        self.approximate_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Newest version of `key` at or below `snapshot`.
    #[must_use]
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Lookup {
        let probe = InternalKey {
            user_key: key.to_vec(),
            sequence: snapshot.get(),
        };
        match self.entries.range(probe..).next() {
            Some(entry) if entry.key().user_key == key => match entry.value() {
                Value::Put(v) => Lookup::Value(v.clone()),
                Value::Tombstone => Lookup::Tombstone,
            },
            _ => Lookup::Miss,
        }
    }

    /// Number of stored versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no version has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rough payload footprint in bytes.
    #[must_use]
    pub fn approximate_bytes(&self) -> usize {
        self.approximate_bytes.load(Ordering::Relaxed)
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemtableSink for Memtable {
    fn insert(&self, batch: &WriteBatch, sequence: SequenceNumber) -> Result<()> {
        self.apply(batch, sequence)
    }
}
