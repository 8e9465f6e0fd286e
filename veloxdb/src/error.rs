//! Error kinds observable to callers of the engine, per the error handling
//! design: expected failures are typed results, fatal conditions (Corruption,
//! OutOfMemory, UnsupportedFormat) trigger orderly shutdown.

use thiserror::Error;

/// The crate-wide result alias, matching the teacher's `CResult` convention.
pub type CResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Write-write conflict detected at commit; caller should retry.
    #[error("write-write conflict on commit")]
    Conflict,

    /// A unique index already holds a live entry for the key being inserted.
    #[error("unique constraint violation on index {index}")]
    UniqueConstraintViolation { index: String },

    /// A PreventDelete reference blocked a delete, or a reference points at
    /// an object that does not exist.
    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// An operation used a class/property descriptor that is stale relative
    /// to the engine's current schema version.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Transient inability to create a transaction (e.g. during a schema
    /// update / alignment window).
    #[error("database busy: {0}")]
    DatabaseBusy(String),

    /// The database is shutting down and no longer accepts new work.
    #[error("database disposed")]
    DatabaseDisposed,

    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Restore detected an invalid block marker or an inconsistent header.
    /// Fatal: triggers orderly shutdown.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The allocator failed to satisfy a request. Fatal.
    #[error("out of memory")]
    OutOfMemory,

    /// A log or snapshot file declares a format version newer than this
    /// build supports. Fatal.
    #[error("unsupported format version {found}, max supported is {max}")]
    UnsupportedFormat { found: u64, max: u64 },

    /// An invariant that should be impossible was violated; indicates a bug
    /// rather than an expected runtime condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Fatal kinds trigger an orderly shutdown per the propagation policy in
    /// spec.md §7: local recovery is never attempted for these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_) | Error::OutOfMemory | Error::UnsupportedFormat { .. }
        )
    }
}
