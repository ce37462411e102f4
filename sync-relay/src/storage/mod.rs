//! Storage layer for offsync-relay.
//!
//! The relay owns the authoritative copy of every record, the per-tenant
//! change log, the lease table and the idempotency record of applied
//! mutations.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use sync_types::{
    CachedRecord, ChangesPage, EntityKey, LockHolder, LockId, MutationAck, MutationRequest,
    RecordLock, Sequence, TenantId, Timestamp,
};

/// Trait for remote store backends.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Apply a mutation, append it to the tenant's change log and return the
    /// acknowledgement.
    ///
    /// A mutation id that was already applied returns the original ack
    /// without touching the record again.
    async fn apply_mutation(
        &self,
        request: &MutationRequest,
        now: Timestamp,
    ) -> Result<MutationAck, StorageError>;

    /// Current state of one record, tombstones included.
    async fn get_record(
        &self,
        tenant_id: &TenantId,
        entity: &EntityKey,
    ) -> Result<Option<CachedRecord>, StorageError>;

    /// Changes with a sequence above `after`, oldest first, at most `limit`.
    async fn changes_since(
        &self,
        tenant_id: &TenantId,
        after: Sequence,
        limit: u32,
    ) -> Result<ChangesPage, StorageError>;

    /// Highest sequence assigned for the tenant, zero if none.
    async fn max_sequence(&self, tenant_id: &TenantId) -> Result<Sequence, StorageError>;

    /// Grant or refresh the lease on a record.
    async fn acquire_lock(
        &self,
        tenant_id: &TenantId,
        entity: &EntityKey,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, StorageError>;

    /// Extend a live lease held by `holder`.
    async fn renew_lock(
        &self,
        lock_id: &LockId,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, StorageError>;

    /// Drop a lease held by `holder`.
    async fn release_lock(
        &self,
        lock_id: &LockId,
        holder: &LockHolder,
    ) -> Result<RecordLock, StorageError>;

    /// Delete leases that ran out. Returns how many were removed.
    async fn purge_expired_locks(&self, now: Timestamp) -> Result<u64, StorageError>;
}
