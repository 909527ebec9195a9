//! Write batches: the unit of atomic submission to the write path.
//!
//! A batch is an ordered list of Put / Delete / Merge operations committed
//! together under one base sequence number. Operation `i` of a batch whose
//! first operation was assigned sequence `s` commits at sequence `s + i`.
//!
//! # Encoding
//!
//! The WAL payload encoding is length-prefixed and self-describing:
//!
//! ```text
//! header:  count   u32-le
//! per op:  tag     u8          (1 = Put, 2 = Delete, 3 = Merge)
//!          key_len u32-le
//!          key     [u8]
//!          val_len u32-le      (Put and Merge only)
//!          val     [u8]
//! ```
//!
//! `byte_size` is the encoded length and is maintained incrementally so
//! that group assembly never re-serializes a batch to size it.

use loam_error::{LoamError, Result};

/// Encoded size of the batch header (operation count).
pub const BATCH_HEADER_SIZE: usize = 4;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_MERGE: u8 = 3;

/// A single operation within a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set `key` to `value`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key`.
    Delete { key: Vec<u8> },
    /// Combine `operand` with the existing value of `key` via the engine's
    /// merge operator. Merges are not commutative with concurrent
    /// inserters, which the write path accounts for when forming groups.
    Merge { key: Vec<u8>, operand: Vec<u8> },
}

impl BatchOp {
    fn encoded_size(&self) -> usize {
        match self {
            Self::Put { key, value } | Self::Merge { key, operand: value } => {
                1 + 4 + key.len() + 4 + value.len()
            }
            Self::Delete { key } => 1 + 4 + key.len(),
        }
    }
}

/// An ordered set of operations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    byte_size: usize,
    has_merge: bool,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            byte_size: BATCH_HEADER_SIZE,
            has_merge: false,
        }
    }

    /// Append a Put operation.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Append a Delete operation.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(BatchOp::Delete { key: key.into() })
    }

    /// Append a Merge operation.
    pub fn merge(&mut self, key: impl Into<Vec<u8>>, operand: impl Into<Vec<u8>>) -> &mut Self {
        self.push(BatchOp::Merge {
            key: key.into(),
            operand: operand.into(),
        })
    }

    fn push(&mut self, op: BatchOp) -> &mut Self {
        self.byte_size += op.encoded_size();
        self.has_merge |= matches!(op, BatchOp::Merge { .. });
        self.ops.push(op);
        self
    }

    /// Number of operations in this batch.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.ops.len() as u64
    }

    /// `true` if the batch contains no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Encoded size in bytes, including the header.
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Whether any operation in this batch is a Merge.
    #[must_use]
    pub const fn has_merge(&self) -> bool {
        self.has_merge
    }

    /// The operations, in application order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Serialize to the WAL payload encoding.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size);
        buf.extend_from_slice(&u32::try_from(self.ops.len()).unwrap_or(u32::MAX).to_le_bytes());
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.push(TAG_PUT);
                    encode_slice(&mut buf, key);
                    encode_slice(&mut buf, value);
                }
                BatchOp::Delete { key } => {
                    buf.push(TAG_DELETE);
                    encode_slice(&mut buf, key);
                }
                BatchOp::Merge { key, operand } => {
                    buf.push(TAG_MERGE);
                    encode_slice(&mut buf, key);
                    encode_slice(&mut buf, operand);
                }
            }
        }
        buf
    }

    /// Decode a batch from its WAL payload encoding.
    ///
    /// # Errors
    ///
    /// Returns [`LoamError::Corrupt`] on truncated input or an unknown
    /// operation tag.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let count = cursor.read_u32()?;
        let mut batch = Self::new();
        for _ in 0..count {
            let tag = cursor.read_u8()?;
            match tag {
                TAG_PUT => {
                    let key = cursor.read_slice()?;
                    let value = cursor.read_slice()?;
                    batch.put(key, value);
                }
                TAG_DELETE => {
                    let key = cursor.read_slice()?;
                    batch.delete(key);
                }
                TAG_MERGE => {
                    let key = cursor.read_slice()?;
                    let operand = cursor.read_slice()?;
                    batch.merge(key, operand);
                }
                other => {
                    return Err(LoamError::corrupt(format!(
                        "unknown batch op tag {other}"
                    )));
                }
            }
        }
        if cursor.pos != data.len() {
            return Err(LoamError::corrupt(format!(
                "trailing garbage after batch: {} bytes",
                data.len() - cursor.pos
            )));
        }
        Ok(batch)
    }
}

fn encode_slice(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&u32::try_from(s.len()).unwrap_or(u32::MAX).to_le_bytes());
    buf.extend_from_slice(s);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(LoamError::ShortRead {
                expected: self.pos + 1,
                actual: self.data.len(),
            })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(LoamError::ShortRead {
                expected: end,
                actual: self.data.len(),
            })?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| {
            LoamError::internal("u32 slice length mismatch")
        })?))
    }

    fn read_slice(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let end = self.pos + len;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(LoamError::ShortRead {
                expected: end,
                actual: self.data.len(),
            })?;
        self.pos = end;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch() {
        let b = WriteBatch::new();
        assert!(b.is_empty());
        assert_eq!(b.count(), 0);
        assert_eq!(b.byte_size(), BATCH_HEADER_SIZE);
        assert!(!b.has_merge());
    }

    #[test]
    fn byte_size_tracks_ops() {
        let mut b = WriteBatch::new();
        b.put(b"key".to_vec(), b"value".to_vec());
        // header + tag + 4 + 3 + 4 + 5
        assert_eq!(b.byte_size(), BATCH_HEADER_SIZE + 1 + 4 + 3 + 4 + 5);
        let before = b.byte_size();
        b.delete(b"key".to_vec());
        assert_eq!(b.byte_size(), before + 1 + 4 + 3);
    }

    #[test]
    fn has_merge_is_sticky() {
        let mut b = WriteBatch::new();
        b.put(b"a".to_vec(), b"1".to_vec());
        assert!(!b.has_merge());
        b.merge(b"a".to_vec(), b"2".to_vec());
        assert!(b.has_merge());
        b.delete(b"a".to_vec());
        assert!(b.has_merge());
    }

    #[test]
    fn encode_matches_byte_size() {
        let mut b = WriteBatch::new();
        b.put(b"alpha".to_vec(), b"1".to_vec())
            .delete(b"beta".to_vec())
            .merge(b"gamma".to_vec(), b"2".to_vec());
        assert_eq!(b.encode().len(), b.byte_size());
    }

    #[test]
    fn decode_round_trip() {
        let mut b = WriteBatch::new();
        b.put(b"k1".to_vec(), b"v1".to_vec())
            .delete(b"k2".to_vec())
            .merge(b"k3".to_vec(), b"m".to_vec());
        let decoded = WriteBatch::decode(&b.encode()).unwrap();
        assert_eq!(decoded, b);
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut b = WriteBatch::new();
        b.put(b"key".to_vec(), b"value".to_vec());
        let encoded = b.encode();
        for cut in 1..encoded.len() {
            assert!(
                WriteBatch::decode(&encoded[..cut]).is_err(),
                "truncation at {cut} must be rejected"
            );
        }
    }

    #[test]
    fn decode_rejects_bad_tag() {
        let mut encoded = WriteBatch::new().encode();
        encoded[0] = 1; // count = 1
        encoded.push(99); // unknown tag
        assert!(WriteBatch::decode(&encoded).is_err());
    }
}
