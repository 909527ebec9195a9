//! loam: an embedded log-structured key-value engine.
//!
//! The write path is a group-commit pipeline: concurrent writers coalesce
//! into single WAL appends and fan out across the skiplist memtable, with
//! a total order on commits and no global mutex in the hot path. See the
//! `loam-write` crate for the coordinator itself.
//!
//! ```no_run
//! use loam::{Db, DbOptions};
//!
//! # fn main() -> loam::Result<()> {
//! let db = Db::open(DbOptions::new("/tmp/example-db"))?;
//! db.put("species", "earthworm")?;
//! assert_eq!(db.get(b"species"), Some(b"earthworm".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod memtable;
pub mod wal;

pub use db::Db;
pub use loam_error::{ErrorCode, LoamError, Result};
pub use loam_types::{BatchOp, DbOptions, SequenceNumber, WriteBatch, WriteConfig, WriteOptions};
pub use loam_write::{WriteCallback, write_metrics, WriteMetrics};
pub use memtable::{Lookup, Memtable};
pub use wal::{LogWriter, WAL_FORMAT_VERSION, WAL_MAGIC};
