//! # sync-types
//!
//! Data model and wire types for the offsync local-first sync core.
//!
//! This crate provides the foundational types used across all offsync crates:
//! - [`MutationId`], [`LockId`], [`DeviceId`], [`TenantId`], [`UserId`], [`EntityKey`] - Identity types
//! - [`Version`], [`Sequence`], [`Timestamp`] - Ordering types
//! - [`SyncQueueEntry`], [`RecordLock`], [`OfflineLock`], [`CachedRecord`] - Stored records
//! - [`MutationRequest`], [`ChannelMessage`], ... - Remote API bodies and channel frames
//! - [`SyncError`] - Encoding errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod model;

pub use error::{decode, encode, SyncError};
pub use ids::{
    now_millis, DeviceId, EntityKey, LockId, MutationId, Sequence, TenantId, Timestamp, UserId,
    Version,
};
pub use messages::{
    ChangeNotification, ChangesPage, ChannelMessage, ErrorBody, HealthResponse, LockConflict,
    LockRequest, MutationAck, MutationConflict, MutationRequest, SchemaVersionResponse, Subscribe,
};
pub use model::{
    CachedRecord, EntryStatus, LockHolder, OfflineLock, OperationType, RecordLock, SchemaVersion,
    SyncQueueEntry, LOCAL_ORIGIN,
};
