//! The engine facade: a log-structured KV store wired through the
//! group-commit pipeline.
//!
//! Writes of any concurrency funnel into [`CommitPipeline::submit`];
//! reads snapshot the last visible sequence and probe the memtables.
//! Freezing the active memtable and rotating the WAL segment serialize
//! against the write stream through the coordinator's unbatched gate, so
//! no commit ever straddles a rotation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loam_error::Result;
use loam_types::{DbOptions, SequenceNumber, WriteBatch, WriteOptions};
use loam_write::{CommitPipeline, MemtableSink, WriteCallback};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::memtable::{Lookup, Memtable};
use crate::wal::{replay, LogWriter};

/// The active memtable plus the frozen ones awaiting compaction, newest
/// last. Inserts land in the active table; lookups consult newest first.
struct MemtableSet {
    active: RwLock<Arc<Memtable>>,
    frozen: RwLock<Vec<Arc<Memtable>>>,
}

impl MemtableSet {
    fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(Memtable::new())),
            frozen: RwLock::new(Vec::new()),
        }
    }

    /// Swap in a fresh active table. Runs only under the unbatched gate,
    /// with no insert in flight.
    fn freeze(&self) {
        let mut active = self.active.write();
        if active.is_empty() {
            return;
        }
        let old = std::mem::replace(&mut *active, Arc::new(Memtable::new()));
        self.frozen.write().push(old);
    }

    fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Lookup {
        match self.active.read().get(key, snapshot) {
            Lookup::Miss => {}
            hit => return hit,
        }
        for table in self.frozen.read().iter().rev() {
            match table.get(key, snapshot) {
                Lookup::Miss => {}
                hit => return hit,
            }
        }
        Lookup::Miss
    }
}

impl MemtableSink for MemtableSet {
    fn insert(&self, batch: &WriteBatch, sequence: SequenceNumber) -> Result<()> {
        self.active.read().apply(batch, sequence)
    }
}

fn wal_segment_path(dir: &Path, seg: u64) -> PathBuf {
    dir.join(format!("wal-{seg:06}.log"))
}

/// List `(segment_number, path)` pairs in ascending segment order.
fn list_wal_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(number) = name
            .strip_prefix("wal-")
            .and_then(|rest| rest.strip_suffix(".log"))
        {
            if let Ok(seg) = number.parse::<u64>() {
                segments.push((seg, entry.path()));
            }
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// An embedded log-structured key-value store.
pub struct Db {
    options: DbOptions,
    pipeline: CommitPipeline<LogWriter, MemtableSet>,
    wal: Arc<LogWriter>,
    memtables: Arc<MemtableSet>,
    next_wal_segment: AtomicU64,
    /// Serializes freeze/rotate cycles; released around the unbatched
    /// gate like any engine-wide lock must be.
    flush_mu: Mutex<()>,
}

impl Db {
    /// Open (or create) a database under `options.dir`, replaying every
    /// WAL segment found there.
    pub fn open(options: DbOptions) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;

        let memtables = Arc::new(MemtableSet::new());
        let mut last_sequence = SequenceNumber::ZERO;
        let mut max_segment = 0;
        for (seg, path) in list_wal_segments(&options.dir)? {
            let last = replay(&path, |sequence, batch| {
                memtables.insert(batch, sequence)
            })?;
            last_sequence = last_sequence.max(last);
            max_segment = seg;
            tracing::info!(
                target: "loam.db",
                segment = seg,
                last_sequence = last.get(),
                "wal segment replayed"
            );
        }

        let next_segment = max_segment + 1;
        let wal = Arc::new(LogWriter::create(wal_segment_path(
            &options.dir,
            next_segment,
        ))?);

        let pipeline = CommitPipeline::new(
            &options.write,
            Arc::clone(&wal),
            Arc::clone(&memtables),
            last_sequence,
        );

        tracing::info!(
            target: "loam.db",
            dir = %options.dir.display(),
            last_sequence = last_sequence.get(),
            "database opened"
        );
        Ok(Self {
            options,
            pipeline,
            wal,
            memtables,
            next_wal_segment: AtomicU64::new(next_segment + 1),
            flush_mu: Mutex::new(()),
        })
    }

    /// Commit one batch. Returns the sequence of its first operation.
    pub fn write(&self, batch: WriteBatch, opts: &WriteOptions) -> Result<SequenceNumber> {
        self.pipeline.submit(batch, opts)
    }

    /// [`write`](Self::write) with a pre-commit callback.
    pub fn write_with_callback(
        &self,
        batch: WriteBatch,
        opts: &WriteOptions,
        callback: Box<dyn WriteCallback>,
    ) -> Result<SequenceNumber> {
        self.pipeline.submit_with_callback(batch, opts, Some(callback))
    }

    /// Set `key` to `value` with the engine's default durability.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, &self.default_write_options())
    }

    /// Remove `key`.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, &self.default_write_options())
    }

    /// Merge `operand` into `key` via the append operator.
    pub fn merge(
        &self,
        key: impl Into<Vec<u8>>,
        operand: impl Into<Vec<u8>>,
    ) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.merge(key, operand);
        self.write(batch, &self.default_write_options())
    }

    /// Read the newest committed value of `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let snapshot = self.pipeline.last_visible_sequence();
        match self.memtables.get(key, snapshot) {
            Lookup::Value(v) => Some(v),
            Lookup::Tombstone | Lookup::Miss => None,
        }
    }

    /// Sequence of the most recent visible operation.
    #[must_use]
    pub fn last_sequence(&self) -> SequenceNumber {
        self.pipeline.last_visible_sequence()
    }

    /// Freeze the active memtable and continue in a fresh WAL segment.
    /// The handoff runs under the coordinator's unbatched gate, so it
    /// lands at a clean point in the commit order. Writing frozen tables
    /// out to sorted files is the compaction subsystem's business.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.flush_mu.lock();
        MutexGuard::unlocked(&mut guard, || {
            self.pipeline.exclusive(|| {
                let seg = self.next_wal_segment.fetch_add(1, Ordering::Relaxed);
                self.wal.rotate(wal_segment_path(&self.options.dir, seg))?;
                self.memtables.freeze();
                Ok(())
            })
        })
    }

    /// Apply write back-pressure: new writers park (or fail, if they ask
    /// not to wait) until [`resume_writes`](Self::resume_writes).
    pub fn stall_writes(&self) {
        self.pipeline.begin_write_stall();
    }

    /// Release back-pressure installed by [`stall_writes`](Self::stall_writes).
    pub fn resume_writes(&self) {
        self.pipeline.end_write_stall();
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    fn default_write_options(&self) -> WriteOptions {
        WriteOptions {
            sync: self.options.sync_writes,
            ..WriteOptions::default()
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.options.dir)
            .field("last_sequence", &self.last_sequence().get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_paths_are_zero_padded_and_sorted() {
        let dir = tempdir().unwrap();
        for seg in [3u64, 1, 12] {
            fs::write(wal_segment_path(dir.path(), seg), b"x").unwrap();
        }
        fs::write(dir.path().join("not-a-segment.txt"), b"x").unwrap();
        let segments = list_wal_segments(dir.path()).unwrap();
        let numbers: Vec<u64> = segments.iter().map(|&(n, _)| n).collect();
        assert_eq!(numbers, vec![1, 3, 12]);
    }

    #[test]
    fn memtable_set_consults_frozen_tables() {
        let set = MemtableSet::new();
        let mut b = WriteBatch::new();
        b.put(b"old".to_vec(), b"1".to_vec());
        set.insert(&b, SequenceNumber(1)).unwrap();
        set.freeze();
        let mut b = WriteBatch::new();
        b.put(b"new".to_vec(), b"2".to_vec());
        set.insert(&b, SequenceNumber(2)).unwrap();

        assert_eq!(
            set.get(b"old", SequenceNumber(5)),
            Lookup::Value(b"1".to_vec())
        );
        assert_eq!(
            set.get(b"new", SequenceNumber(5)),
            Lookup::Value(b"2".to_vec())
        );
        assert_eq!(set.get(b"gone", SequenceNumber(5)), Lookup::Miss);
    }

    #[test]
    fn freeze_skips_empty_active_table() {
        let set = MemtableSet::new();
        set.freeze();
        assert!(set.frozen.read().is_empty());
    }
}
