//! Error types for offsync-relay.

use sync_core::LeaseError;
use sync_types::{MutationConflict, SyncError};

/// Main error type for offsync-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] SyncError),

    /// A row holds a value that does not parse back into its type.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Lease rules refused the request.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// The mutation was based on a version that is no longer current.
    #[error("mutation {} conflicts with the current record", .0.mutation_id)]
    Conflict(MutationConflict),

    /// The request is malformed.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
