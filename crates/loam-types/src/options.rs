//! Per-write flags and engine-wide write-path configuration.

use std::path::PathBuf;

/// Per-write flags constraining how a batch may be grouped and persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fsync the WAL before the write is acknowledged.
    pub sync: bool,
    /// Skip the WAL entirely. The write is lost on crash until the
    /// memtable is flushed.
    pub disable_wal: bool,
    /// Fail immediately with a write-stall error instead of waiting when
    /// back-pressure is in effect.
    pub no_slowdown: bool,
    /// Skip the memtable. Used by two-phase commit preludes that only
    /// need the WAL record.
    pub disable_memtable: bool,
}

impl WriteOptions {
    /// Whether this write's batch must reach the memtable.
    #[must_use]
    pub const fn should_write_to_memtable(&self) -> bool {
        !self.disable_memtable
    }
}

/// Write-path tuning knobs.
///
/// The defaults favor throughput on multi-core hosts: concurrent memtable
/// insertion on, adaptive yield on with the 100 µs / 3 µs thresholds, and
/// the classic single-stage commit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConfig {
    /// Split the commit into separate WAL and memtable stages with
    /// independent leaders, letting a new WAL group form while the
    /// previous group drains into the memtable.
    pub enable_pipelined_write: bool,

    /// Let followers insert their own batches into the memtable in
    /// parallel instead of the leader applying everything.
    pub allow_concurrent_memtable_write: bool,

    /// Enable the middle (yield) tier of the write-thread wait. When
    /// disabled, a waiter falls straight from spinning to blocking.
    pub enable_write_thread_adaptive_yield: bool,

    /// Budget for the yield tier, in microseconds.
    pub write_thread_max_yield_usec: u64,

    /// A single yield slower than this (microseconds) counts as evidence
    /// that the scheduler is preempting us and blocking would be cheaper.
    pub write_thread_slow_yield_usec: u64,

    /// Capacity of the writer slot pool: the maximum number of writes
    /// that can be in flight in the coordinator at once. Submitters
    /// beyond this park until a slot frees.
    pub max_writers: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            enable_pipelined_write: false,
            allow_concurrent_memtable_write: true,
            enable_write_thread_adaptive_yield: true,
            write_thread_max_yield_usec: 100,
            write_thread_slow_yield_usec: 3,
            max_writers: 256,
        }
    }
}

impl WriteConfig {
    /// Validate and clamp configuration values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.max_writers == 0 {
            self.max_writers = 1;
        }
        if self.write_thread_slow_yield_usec > self.write_thread_max_yield_usec {
            self.write_thread_slow_yield_usec = self.write_thread_max_yield_usec;
        }
        self
    }

    /// Effective yield budget: zero when the adaptive yield tier is off.
    #[must_use]
    pub const fn max_yield_usec(&self) -> u64 {
        if self.enable_write_thread_adaptive_yield {
            self.write_thread_max_yield_usec
        } else {
            0
        }
    }
}

/// Engine-level options for opening a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbOptions {
    /// Directory holding the WAL segments.
    pub dir: PathBuf,
    /// Write-path tuning.
    pub write: WriteConfig,
    /// Default `sync` flag for writes submitted through the convenience
    /// `put` / `delete` / `merge` helpers.
    pub sync_writes: bool,
}

impl DbOptions {
    /// Options rooted at `dir` with all defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write: WriteConfig::default(),
            sync_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = WriteConfig::default();
        assert!(!cfg.enable_pipelined_write);
        assert!(cfg.allow_concurrent_memtable_write);
        assert_eq!(cfg.write_thread_max_yield_usec, 100);
        assert_eq!(cfg.write_thread_slow_yield_usec, 3);
        assert_eq!(cfg.max_yield_usec(), 100);
    }

    #[test]
    fn yield_budget_zero_when_disabled() {
        let cfg = WriteConfig {
            enable_write_thread_adaptive_yield: false,
            ..WriteConfig::default()
        };
        assert_eq!(cfg.max_yield_usec(), 0);
    }

    #[test]
    fn validated_clamps() {
        let cfg = WriteConfig {
            max_writers: 0,
            write_thread_max_yield_usec: 2,
            write_thread_slow_yield_usec: 10,
            ..WriteConfig::default()
        }
        .validated();
        assert_eq!(cfg.max_writers, 1);
        assert_eq!(cfg.write_thread_slow_yield_usec, 2);
    }

    #[test]
    fn memtable_routing() {
        assert!(WriteOptions::default().should_write_to_memtable());
        let opts = WriteOptions {
            disable_memtable: true,
            ..WriteOptions::default()
        };
        assert!(!opts.should_write_to_memtable());
    }
}
