//! Write-path counters.
//!
//! Global atomics with `Relaxed` ordering; a snapshot is a plain struct
//! with the derived ratios, serializable for log shipping. `reset` exists
//! for tests only.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static LOAM_WRITE_GROUPS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_WRITERS_GROUPED_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_GROUP_SIZE_MAX: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_WAL_GROUPS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_PARALLEL_LAUNCHES_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_STALL_REJECTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_BLOCKING_WAITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOAM_WRITE_YIELD_SUCCESSES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Point-in-time snapshot of write-path metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteMetrics {
    pub loam_write_groups_total: u64,
    pub loam_write_writers_grouped_total: u64,
    pub loam_write_group_size_max: u64,
    pub loam_write_wal_groups_total: u64,
    pub loam_write_parallel_launches_total: u64,
    pub loam_write_stall_rejections_total: u64,
    pub loam_write_blocking_waits_total: u64,
    pub loam_write_yield_successes_total: u64,
}

impl WriteMetrics {
    /// Average writers per group, or 0 if no groups have formed.
    #[must_use]
    pub fn avg_group_size(&self) -> u64 {
        self.loam_write_writers_grouped_total
            .checked_div(self.loam_write_groups_total)
            .unwrap_or(0)
    }

    /// Fsync reduction: writers committed per WAL group write.
    #[must_use]
    pub fn wal_amortization(&self) -> u64 {
        self.loam_write_writers_grouped_total
            .checked_div(self.loam_write_wal_groups_total)
            .unwrap_or(0)
    }
}

/// Read current write-path metrics.
#[must_use]
pub fn write_metrics() -> WriteMetrics {
    WriteMetrics {
        loam_write_groups_total: LOAM_WRITE_GROUPS_TOTAL.load(Ordering::Relaxed),
        loam_write_writers_grouped_total: LOAM_WRITE_WRITERS_GROUPED_TOTAL.load(Ordering::Relaxed),
        loam_write_group_size_max: LOAM_WRITE_GROUP_SIZE_MAX.load(Ordering::Relaxed),
        loam_write_wal_groups_total: LOAM_WRITE_WAL_GROUPS_TOTAL.load(Ordering::Relaxed),
        loam_write_parallel_launches_total: LOAM_WRITE_PARALLEL_LAUNCHES_TOTAL
            .load(Ordering::Relaxed),
        loam_write_stall_rejections_total: LOAM_WRITE_STALL_REJECTIONS_TOTAL
            .load(Ordering::Relaxed),
        loam_write_blocking_waits_total: LOAM_WRITE_BLOCKING_WAITS_TOTAL.load(Ordering::Relaxed),
        loam_write_yield_successes_total: LOAM_WRITE_YIELD_SUCCESSES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset all counters to zero (for tests).
pub fn reset_write_metrics() {
    LOAM_WRITE_GROUPS_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_WRITERS_GROUPED_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_GROUP_SIZE_MAX.store(0, Ordering::Relaxed);
    LOAM_WRITE_WAL_GROUPS_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_PARALLEL_LAUNCHES_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_STALL_REJECTIONS_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_BLOCKING_WAITS_TOTAL.store(0, Ordering::Relaxed);
    LOAM_WRITE_YIELD_SUCCESSES_TOTAL.store(0, Ordering::Relaxed);
}

fn update_max(metric: &AtomicU64, val: u64) {
    let mut prev = metric.load(Ordering::Relaxed);
    while val > prev {
        match metric.compare_exchange_weak(prev, val, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => prev = actual,
        }
    }
}

pub(crate) fn record_group_formed(size: usize) {
    let size = size as u64;
    LOAM_WRITE_GROUPS_TOTAL.fetch_add(1, Ordering::Relaxed);
    LOAM_WRITE_WRITERS_GROUPED_TOTAL.fetch_add(size, Ordering::Relaxed);
    update_max(&LOAM_WRITE_GROUP_SIZE_MAX, size);
}

pub(crate) fn record_wal_group() {
    LOAM_WRITE_WAL_GROUPS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_parallel_launch() {
    LOAM_WRITE_PARALLEL_LAUNCHES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_stall_rejection() {
    LOAM_WRITE_STALL_REJECTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_blocking_wait() {
    LOAM_WRITE_BLOCKING_WAITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_yield_success() {
    LOAM_WRITE_YIELD_SUCCESSES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_ratios() {
        let before = write_metrics();
        record_group_formed(3);
        record_group_formed(5);
        record_wal_group();
        let after = write_metrics();
        assert_eq!(
            after.loam_write_groups_total - before.loam_write_groups_total,
            2
        );
        assert_eq!(
            after.loam_write_writers_grouped_total - before.loam_write_writers_grouped_total,
            8
        );
        assert!(after.loam_write_group_size_max >= 5);
    }

    #[test]
    fn ratios_survive_zero_denominator() {
        let empty = WriteMetrics {
            loam_write_groups_total: 0,
            loam_write_writers_grouped_total: 0,
            loam_write_group_size_max: 0,
            loam_write_wal_groups_total: 0,
            loam_write_parallel_launches_total: 0,
            loam_write_stall_rejections_total: 0,
            loam_write_blocking_waits_total: 0,
            loam_write_yield_successes_total: 0,
        };
        assert_eq!(empty.avg_group_size(), 0);
        assert_eq!(empty.wal_amortization(), 0);
    }
}
