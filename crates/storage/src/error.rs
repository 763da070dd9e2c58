//! Storage error type.

use thiserror::Error;

/// Errors surfaced by a persistence backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The relational backend rejected or lost a statement.
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// The backend has been closed.
    #[error("store is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;
