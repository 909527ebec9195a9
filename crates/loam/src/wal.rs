//! Write-ahead log segments.
//!
//! A segment is a header followed by length-prefixed records, one per
//! committed batch:
//!
//! ```text
//! header:  magic    u32-le      ("LOAM")
//!          version  u32-le
//! record:  len      u32-le      (payload bytes)
//!          sequence u64-le      (first operation of the batch)
//!          checksum u64-le      (xxh3-64 of the payload)
//!          payload  [u8; len]   (encoded batch)
//! ```
//!
//! A whole group is written with one buffered write burst and at most one
//! `fsync`, which is the entire point of group commit. Replay walks the
//! records forward and treats a short or checksum-failing tail as a torn
//! write from a crash: everything before it is kept, the tail is
//! discarded.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use loam_error::{LoamError, Result};
use loam_types::{SequenceNumber, WriteBatch};
use loam_write::{WalRecord, WalSink};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

/// Segment file magic: `LOAM`.
pub const WAL_MAGIC: u32 = 0x4d41_4f4c;
/// Current segment format version.
pub const WAL_FORMAT_VERSION: u32 = 1;
/// Bytes of fixed header per record.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 8;

struct SegmentFile {
    writer: BufWriter<File>,
    path: PathBuf,
}

/// Appending side of the log. One instance lives for the life of the
/// engine; rotation swaps the underlying segment in place.
pub struct LogWriter {
    inner: Mutex<SegmentFile>,
}

impl LogWriter {
    /// Create a fresh segment at `path`, truncating any previous file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Mutex::new(Self::open_segment(path.as_ref())?);
        Ok(Self { inner })
    }

    fn open_segment(path: &Path) -> Result<SegmentFile> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&WAL_MAGIC.to_le_bytes())?;
        writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        writer.flush()?;
        tracing::debug!(target: "loam.wal", path = %path.display(), "wal segment created");
        Ok(SegmentFile {
            writer,
            path: path.to_path_buf(),
        })
    }

    /// Seal the current segment (flush + fsync) and continue in a new one
    /// at `path`. Callers quiesce the write path first.
    pub fn rotate(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        let sealed = inner.path.clone();
        *inner = Self::open_segment(path.as_ref())?;
        tracing::info!(
            target: "loam.wal",
            sealed = %sealed.display(),
            next = %inner.path.display(),
            "wal segment rotated"
        );
        Ok(())
    }

    /// Path of the segment currently being appended.
    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }
}

impl WalSink for LogWriter {
    fn write_records(&self, records: &[WalRecord<'_>], sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        for record in records {
            let payload = record.batch.encode();
            let len = u32::try_from(payload.len())
                .map_err(|_| LoamError::wal_write("batch exceeds record size limit"))?;
            inner.writer.write_all(&len.to_le_bytes())?;
            inner
                .writer
                .write_all(&record.sequence.get().to_le_bytes())?;
            inner.writer.write_all(&xxh3_64(&payload).to_le_bytes())?;
            inner.writer.write_all(&payload)?;
        }
        inner.writer.flush()?;
        if sync {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Replay every intact record of the segment at `path` in order, calling
/// `apply` with each batch and its base sequence. Returns the sequence of
/// the last operation replayed (zero if the segment is empty).
///
/// # Errors
///
/// Fails on a missing file or an unrecognized header. A torn tail is not
/// an error; replay stops there.
pub fn replay(
    path: impl AsRef<Path>,
    mut apply: impl FnMut(SequenceNumber, &WriteBatch) -> Result<()>,
) -> Result<SequenceNumber> {
    let path = path.as_ref();
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    if data.len() < 8 {
        return Err(LoamError::corrupt(format!(
            "wal segment {} shorter than its header",
            path.display()
        )));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().expect("slice length is 4"));
    let version = u32::from_le_bytes(data[4..8].try_into().expect("slice length is 4"));
    if magic != WAL_MAGIC {
        return Err(LoamError::corrupt(format!(
            "wal segment {} has bad magic {magic:#x}",
            path.display()
        )));
    }
    if version != WAL_FORMAT_VERSION {
        return Err(LoamError::corrupt(format!(
            "wal segment {} has unsupported version {version}",
            path.display()
        )));
    }

    let mut last = SequenceNumber::ZERO;
    let mut pos = 8;
    while pos < data.len() {
        if data.len() - pos < RECORD_HEADER_SIZE {
            tracing::warn!(
                target: "loam.wal",
                path = %path.display(),
                offset = pos,
                "torn record header at segment tail, discarding"
            );
            break;
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("slice length is 4"))
            as usize;
        let sequence = u64::from_le_bytes(
            data[pos + 4..pos + 12]
                .try_into()
                .expect("slice length is 8"),
        );
        let checksum = u64::from_le_bytes(
            data[pos + 12..pos + 20]
                .try_into()
                .expect("slice length is 8"),
        );
        let body_start = pos + RECORD_HEADER_SIZE;
        if data.len() - body_start < len {
            tracing::warn!(
                target: "loam.wal",
                path = %path.display(),
                offset = pos,
                "torn record payload at segment tail, discarding"
            );
            break;
        }
        let payload = &data[body_start..body_start + len];
        if xxh3_64(payload) != checksum {
            tracing::warn!(
                target: "loam.wal",
                path = %path.display(),
                offset = pos,
                "record checksum mismatch at segment tail, discarding"
            );
            break;
        }
        let batch = WriteBatch::decode(payload)?;
        let count = batch.count();
        apply(SequenceNumber(sequence), &batch)?;
        if count > 0 {
            last = SequenceNumber(sequence + count - 1);
        }
        pos = body_start + len;
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample_batch(tag: u8, ops: usize) -> WriteBatch {
        let mut b = WriteBatch::new();
        for i in 0..ops {
            b.put(vec![tag, i as u8], vec![tag ^ 0xff; 4]);
        }
        b
    }

    fn write_segment(path: &Path, batches: &[(u64, WriteBatch)], sync: bool) {
        let wal = LogWriter::create(path).unwrap();
        let records: Vec<WalRecord<'_>> = batches
            .iter()
            .map(|(seq, batch)| WalRecord {
                sequence: SequenceNumber(*seq),
                batch,
            })
            .collect();
        wal.write_records(&records, sync).unwrap();
    }

    #[test]
    fn replay_returns_batches_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_segment(
            &path,
            &[(1, sample_batch(1, 2)), (3, sample_batch(2, 1))],
            true,
        );

        let mut seen = Vec::new();
        let last = replay(&path, |seq, batch| {
            seen.push((seq.get(), batch.count()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(1, 2), (3, 1)]);
        assert_eq!(last, SequenceNumber(3));
    }

    #[test]
    fn empty_segment_replays_to_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        LogWriter::create(&path).unwrap();
        let last = replay(&path, |_, _| Ok(())).unwrap();
        assert_eq!(last, SequenceNumber::ZERO);
    }

    #[test]
    fn torn_tail_is_discarded_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_segment(&path, &[(1, sample_batch(1, 1))], true);
        // Simulate a crash mid-append.
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&[7, 0, 0, 0, 9, 9]);
        fs::write(&path, &data).unwrap();

        let mut seen = 0;
        let last = replay(&path, |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(last, SequenceNumber(1));
    }

    #[test]
    fn corrupted_payload_stops_replay_at_the_tear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_segment(
            &path,
            &[(1, sample_batch(1, 1)), (2, sample_batch(2, 1))],
            true,
        );
        let mut data = fs::read(&path).unwrap();
        // Flip one payload byte of the second record.
        let len = data.len();
        data[len - 1] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let mut seen = 0;
        let last = replay(&path, |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(last, SequenceNumber(1));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(
            replay(&path, |_, _| Ok(())),
            Err(LoamError::Corrupt { .. })
        ));
    }

    #[test]
    fn rotation_seals_and_continues() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("wal-000001.log");
        let p2 = dir.path().join("wal-000002.log");
        let wal = LogWriter::create(&p1).unwrap();

        let batch = sample_batch(1, 1);
        wal.write_records(
            &[WalRecord {
                sequence: SequenceNumber(1),
                batch: &batch,
            }],
            false,
        )
        .unwrap();
        wal.rotate(&p2).unwrap();
        assert_eq!(wal.current_path(), p2);

        let batch = sample_batch(2, 1);
        wal.write_records(
            &[WalRecord {
                sequence: SequenceNumber(2),
                batch: &batch,
            }],
            true,
        )
        .unwrap();

        let last1 = replay(&p1, |_, _| Ok(())).unwrap();
        let last2 = replay(&p2, |_, _| Ok(())).unwrap();
        assert_eq!(last1, SequenceNumber(1));
        assert_eq!(last2, SequenceNumber(2));
    }
}
