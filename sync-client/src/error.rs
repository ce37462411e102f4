//! Error types for sync-client.
//!
//! Every error exposes [`kind()`](ErrorKind) so callers can decide between
//! retrying, showing a conflict, or giving up without matching on variants.

use sync_core::{LeaseError, QueueStateError};
use sync_types::{LockHolder, LockId, MutationConflict, SyncError, Timestamp};

/// How an error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, connection drops, 5xx. Retried with backoff.
    Transient,
    /// Someone else changed the record or holds the lock. Never retried
    /// automatically; surfaced with the current holder or version.
    Conflict,
    /// Validation rejection or incompatible schema. Surfaced immediately.
    Permanent,
    /// Local store corruption or a failed migration. The engine halts.
    Fatal,
}

/// Local store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be encoded or decoded.
    #[error("stored value codec error: {0}")]
    Codec(#[from] SyncError),

    /// Write refused by the in-memory store (fault injection).
    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl StoreError {
    /// Local store failures are never retried.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Remote store errors.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Could not reach the remote store.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The request did not complete in time.
    #[error("remote request timed out")]
    Timeout,

    /// 5xx answer.
    #[error("remote server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message from the body.
        message: String,
    },

    /// The mutation's base version is stale.
    #[error("mutation conflict (current version: {:?})", .0.current_version)]
    MutationConflict(MutationConflict),

    /// The record is locked by someone else.
    #[error("record locked by {} until {expires_at}", .holder.user_id)]
    LockHeld {
        /// Current holder.
        holder: LockHolder,
        /// When the current lease runs out.
        expires_at: Timestamp,
    },

    /// The lease does not exist (released or purged).
    #[error("lock {0} not found")]
    LockNotFound(LockId),

    /// The lease ran out before the request.
    #[error("lock {0} expired")]
    LockExpired(LockId),

    /// Validation rejection (4xx).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) | Self::Timeout | Self::Server { .. } => ErrorKind::Transient,
            Self::MutationConflict(_) | Self::LockHeld { .. } => ErrorKind::Conflict,
            Self::LockNotFound(_)
            | Self::LockExpired(_)
            | Self::Rejected(_)
            | Self::InvalidResponse(_) => ErrorKind::Permanent,
        }
    }
}

impl From<LeaseError> for RemoteError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Held { holder, expires_at } => Self::LockHeld { holder, expires_at },
            LeaseError::NotFound(id) => Self::LockNotFound(id),
            LeaseError::Expired(id) => Self::LockExpired(id),
            LeaseError::NotHolder(id) => Self::Rejected(format!("lock {id} is held by someone else")),
        }
    }
}

/// Sync queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Drain requested while not Online.
    #[error("not online")]
    NotOnline,

    /// Drain requested before the schema was reconciled.
    #[error("schema not reconciled")]
    SchemaNotReconciled,

    /// Queue bookkeeping refused the operation.
    #[error(transparent)]
    State(#[from] QueueStateError),

    /// Local store error.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOnline | Self::SchemaNotReconciled => ErrorKind::Transient,
            Self::State(_) => ErrorKind::Permanent,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Record lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Remote locks need connectivity.
    #[error("not online")]
    NotOnline,

    /// Another user holds the record.
    #[error("record locked by {} until {expires_at}", .holder.user_id)]
    Conflict {
        /// Current holder, for display.
        holder: LockHolder,
        /// When the current lease runs out.
        expires_at: Timestamp,
    },

    /// This device does not hold the lock.
    #[error("lock {0} is not held")]
    NotHeld(LockId),

    /// The lease ran out.
    #[error("lock {0} expired")]
    Expired(LockId),

    /// The caller cancelled the acquisition.
    #[error("lock acquisition cancelled")]
    Cancelled,

    /// Remote store error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Local store error.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

impl From<RemoteError> for LockError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::LockHeld { holder, expires_at } => Self::Conflict { holder, expires_at },
            RemoteError::LockExpired(id) => Self::Expired(id),
            RemoteError::LockNotFound(id) => Self::NotHeld(id),
            other => Self::Remote(other),
        }
    }
}

impl LockError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOnline => ErrorKind::Transient,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotHeld(_) | Self::Expired(_) | Self::Cancelled => ErrorKind::Permanent,
            Self::Remote(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Schema reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Could not read the remote version.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local cache is newer than the remote store.
    #[error("local schema v{local} is ahead of remote v{remote}")]
    LocalAhead {
        /// Local version.
        local: u32,
        /// Remote version.
        remote: u32,
    },

    /// No migration registered for a required step.
    #[error("no migration registered for schema v{0}")]
    MissingMigration(u32),

    /// A migration failed part-way.
    #[error("migration to v{version} failed: {reason}")]
    MigrationFailed {
        /// Target version of the failed migration.
        version: u32,
        /// What went wrong.
        reason: String,
    },

    /// Local store error.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

impl SchemaError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(e) => match e.kind() {
                ErrorKind::Transient => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            Self::LocalAhead { .. } | Self::MissingMigration(_) => ErrorKind::Permanent,
            Self::MigrationFailed { .. } | Self::Store(_) => ErrorKind::Fatal,
        }
    }
}

/// Realtime channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed by the remote side.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Handshake or heartbeat timed out.
    #[error("channel timeout")]
    Timeout,

    /// Frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] SyncError),

    /// Unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(_) | Self::Protocol(_) => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }
}

/// Realtime handler errors.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Fetching missed changes failed.
    #[error("resync failed: {0}")]
    Remote(#[from] RemoteError),

    /// Writing merged changes failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for RealtimeError {
    fn from(err: SyncError) -> Self {
        Self::Channel(ChannelError::Codec(err))
    }
}

impl RealtimeError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Channel(e) => e.kind(),
            Self::Remote(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Errors returned by [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Lock error.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Schema error.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Realtime error.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    /// Local store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine stopped on a fatal error.
    #[error("engine halted: {0}")]
    Halted(String),

    /// `start()` was called twice.
    #[error("engine already started")]
    AlreadyStarted,
}

impl EngineError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Queue(e) => e.kind(),
            Self::Lock(e) => e.kind(),
            Self::Schema(e) => e.kind(),
            Self::Realtime(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Halted(_) => ErrorKind::Fatal,
            Self::AlreadyStarted => ErrorKind::Permanent,
        }
    }
}
