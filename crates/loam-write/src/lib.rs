//! Group-commit write coordinator for the loam storage engine.
//!
//! Many threads submit independent write batches; the coordinator gathers
//! them into single, serialized commits to the WAL and the memtable,
//! amortizing fsync cost and imposing a total order on committed writes
//! without a global mutex on the fast path.
//!
//! # Protocol
//!
//! ```text
//!            link_one (CAS tail)
//! writer ───────────────────────▶ queue ──▶ leader assembles group
//!                                              │  WAL write, sequences
//!                                              ▼
//!                     unified: parallel memtable fan-out, last one out
//!                     pipelined: splice to memtable queue, next WAL
//!                                leader elected immediately
//! ```
//!
//! Exactly one writer per queue is leader at a time. Followers wait on
//! their own state word through a three-tier adaptive wait (spin, timed
//! yield with per-call-site credit, then a lazily-built condvar).
//! Back-pressure is a sentinel writer parked at the tail; exclusive
//! operations serialize through the same queue as batchless writers.
//!
//! The caller-facing surface is [`CommitPipeline::submit`]; the
//! coordinator primitives on [`WriteController`] are public for engine
//! code and test harnesses that drive roles directly.

pub mod controller;
pub mod group;
pub mod metrics;
pub mod pipeline;
pub mod sink;
mod slot;
mod wait;

pub use controller::{GroupToken, WriteController, WriterTicket};
pub use metrics::{reset_write_metrics, write_metrics, WriteMetrics};
pub use pipeline::CommitPipeline;
pub use sink::{MemtableSink, WalRecord, WalSink, WriteCallback};
pub use slot::{
    STATE_COMPLETED, STATE_GROUP_LEADER, STATE_INIT, STATE_LOCKED_WAITING,
    STATE_MEMTABLE_WRITER_LEADER, STATE_PARALLEL_MEMTABLE_WRITER,
};
pub use wait::AdaptationContext;
