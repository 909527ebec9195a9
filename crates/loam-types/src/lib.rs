//! Core value and configuration types shared across the loam engine.

pub mod batch;
pub mod options;

pub use batch::{BatchOp, WriteBatch, BATCH_HEADER_SIZE};
pub use options::{DbOptions, WriteConfig, WriteOptions};

use std::fmt;

/// A monotonically increasing commit sequence number.
///
/// Sequence 0 is reserved as "no writes yet"; the first committed
/// operation is assigned sequence 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The zero sequence: no operation has ever committed.
    pub const ZERO: Self = Self(0);

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The sequence `n` positions after this one.
    #[inline]
    #[must_use]
    pub const fn advance(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_advance() {
        let s = SequenceNumber(5);
        assert_eq!(s.advance(0), SequenceNumber(5));
        assert_eq!(s.advance(3), SequenceNumber(8));
        assert_eq!(SequenceNumber::ZERO.advance(1).get(), 1);
    }

    #[test]
    fn sequence_ordering() {
        assert!(SequenceNumber(1) < SequenceNumber(2));
        assert_eq!(SequenceNumber(7).to_string(), "7");
    }
}
