use thiserror::Error;

/// Primary error type for loam operations.
///
/// Structured variants for the common cases, with recovery hints for the
/// errors a caller can act on. Write-path errors are `Clone` because a
/// group commit replicates the leader's aggregate status onto every
/// writer in the group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoamError {
    // === Write path ===
    /// The write queue is stalled and the writer asked not to wait.
    #[error("incomplete: write stall")]
    WriteStall,

    /// Appending the group's records to the write-ahead log failed.
    #[error("WAL write failed: {detail}")]
    WalWrite { detail: String },

    /// Inserting a batch into the memtable failed.
    #[error("memtable insert failed: {detail}")]
    MemtableInsert { detail: String },

    /// A pre-commit callback rejected the write.
    #[error("write rejected by callback: {detail}")]
    CallbackRejected { detail: String },

    // === Storage ===
    /// A log or table file is corrupt.
    #[error("corruption: {detail}")]
    Corrupt { detail: String },

    /// File I/O error. The originating `io::ErrorKind` is preserved; the
    /// full `std::io::Error` is not, so that statuses stay cloneable.
    #[error("I/O error ({kind:?}): {detail}")]
    Io {
        kind: std::io::ErrorKind,
        detail: String,
    },

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Engine state ===
    /// The engine is busy; the operation may succeed on retry.
    #[error("engine is busy")]
    Busy,

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// Operation is not supported by the current configuration.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric result codes, stable across releases for logging and tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    WriteStall = 1,
    WalWrite = 2,
    MemtableInsert = 3,
    CallbackRejected = 4,
    Corrupt = 5,
    Io = 6,
    Busy = 7,
    ShutDown = 8,
    Unsupported = 9,
    Internal = 10,
}

impl LoamError {
    /// Map this error to its stable numeric code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::WriteStall => ErrorCode::WriteStall,
            Self::WalWrite { .. } => ErrorCode::WalWrite,
            Self::MemtableInsert { .. } => ErrorCode::MemtableInsert,
            Self::CallbackRejected { .. } => ErrorCode::CallbackRejected,
            Self::Corrupt { .. } => ErrorCode::Corrupt,
            Self::Io { .. } | Self::ShortRead { .. } => ErrorCode::Io,
            Self::Busy => ErrorCode::Busy,
            Self::ShutDown => ErrorCode::ShutDown,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WriteStall | Self::Busy)
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::WriteStall => {
                Some("Retry without no_slowdown, or wait for back-pressure to clear")
            }
            Self::Busy => Some("Retry the operation after a short delay"),
            Self::Corrupt { .. } => Some("Restore the affected file from backup"),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a WAL write error.
    pub fn wal_write(detail: impl Into<String>) -> Self {
        Self::WalWrite {
            detail: detail.into(),
        }
    }

    /// Create a memtable insert error.
    pub fn memtable_insert(detail: impl Into<String>) -> Self {
        Self::MemtableInsert {
            detail: detail.into(),
        }
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

impl From<std::io::Error> for LoamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Result type alias using `LoamError`.
pub type Result<T> = std::result::Result<T, LoamError>;
