use rusqlite::ErrorCode;
use scuttle_shared::{BlobRef, FeedError, FeedRef, MessageError, RefError, ScuttleError};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error that is neither a conflict nor a missing row.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested record does not exist.
    #[error("Record not found")]
    NotFound,

    /// Transient write conflict; the enclosing transaction is retried.
    #[error("Storage conflict")]
    Conflict,

    /// Stored data breaks an invariant. Always a bug.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Feed {0} is banned")]
    Banned(FeedRef),

    #[error("Receive log sequence {0} is already taken")]
    SequenceTaken(u64),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error(transparent)]
    Shared(#[from] ScuttleError),

    #[error("Reference error: {0}")]
    Ref(#[from] RefError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blob of {size} bytes exceeds the limit of {max} bytes")]
    BlobTooLarge { size: u64, max: u64 },

    #[error("Blob content does not hash to {0}")]
    BlobHashMismatch(BlobRef),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Conflict
            }
            other => StoreError::Sqlite(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
