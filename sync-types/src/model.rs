//! Records owned by the local store and the remote store.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, EntityKey, LockId, MutationId, TenantId, Timestamp, UserId, Version};

/// Value of [`SyncQueueEntry::source_origin`] for mutations made on this device.
pub const LOCAL_ORIGIN: &str = "local";

/// Kind of mutation carried by a queue entry or a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a new record.
    Create,
    /// Overwrite an existing record.
    Update,
    /// Delete a record.
    Delete,
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be sent (possibly backing off after a transient failure).
    Pending,
    /// A send is in flight.
    Sending,
    /// Acknowledged by the remote store. Completed entries are removed.
    Completed,
    /// Quarantined: needs a caller decision before it is sent again.
    Failed,
}

/// A mutation that the remote store has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Client-generated id, also the remote idempotency key.
    pub id: MutationId,
    /// Tenant the mutation belongs to.
    pub tenant_id: TenantId,
    /// Create, update or delete.
    pub operation: OperationType,
    /// The record being mutated.
    pub entity: EntityKey,
    /// Serialized record (opaque).
    pub payload: Vec<u8>,
    /// Version the client last saw for this entity (`None` for a create).
    ///
    /// The remote answers with a conflict if its current version differs.
    pub base_version: Option<Version>,
    /// Strictly increasing position in the queue.
    pub sequence: u64,
    /// When the entry was enqueued.
    pub enqueued_at: Timestamp,
    /// Always [`LOCAL_ORIGIN`] for entries created by this device.
    pub source_origin: String,
    /// Current status.
    pub status: EntryStatus,
    /// Number of transient failures so far.
    pub retry_count: u32,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
    /// Earliest time the entry may be sent again.
    pub next_attempt_at: Timestamp,
}

impl SyncQueueEntry {
    /// Whether this entry is waiting for a caller decision.
    pub fn is_failed(&self) -> bool {
        self.status == EntryStatus::Failed
    }
}

/// The user and device holding a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    /// Holding user.
    pub user_id: UserId,
    /// Holding device.
    pub device_id: DeviceId,
}

/// An exclusive, time-bounded lease on one record, granted by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLock {
    /// Lease identifier.
    pub id: LockId,
    /// Tenant scope of the lock.
    pub tenant_id: TenantId,
    /// Locked record.
    pub entity: EntityKey,
    /// Holding user.
    pub holder_user_id: UserId,
    /// Holding device.
    pub holder_device_id: DeviceId,
    /// When the lease runs out unless renewed.
    pub expires_at: Timestamp,
    /// When the lease was first granted.
    pub created_at: Timestamp,
}

impl RecordLock {
    /// Whether the lease is still live at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }

    /// The holder of this lock.
    pub fn holder(&self) -> LockHolder {
        LockHolder {
            user_id: self.holder_user_id.clone(),
            device_id: self.holder_device_id,
        }
    }
}

/// An advisory lock recorded while offline. Never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineLock {
    /// Tenant-scoped key, see [`OfflineLock::key_for`].
    pub id: String,
    /// Locked record.
    pub entity: EntityKey,
    /// User who started the offline edit session.
    pub holder_user_id: UserId,
    /// When the advisory lock was taken.
    pub acquired_at: Timestamp,
    /// When the advisory lock lapses even without a reconnect.
    pub expires_at: Timestamp,
}

impl OfflineLock {
    /// Tenant-scoped key for a record: `tenant:type/id`.
    pub fn key_for(tenant_id: &TenantId, entity: &EntityKey) -> String {
        format!("{}:{}", tenant_id, entity)
    }

    /// Whether the advisory lock is still live at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// The local cache's copy of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord {
    /// The record.
    pub entity: EntityKey,
    /// Last version observed from the remote; `None` for an unacknowledged create.
    pub version: Option<Version>,
    /// Serialized record (opaque).
    pub payload: Vec<u8>,
    /// Tombstone for deleted records.
    pub deleted: bool,
    /// When the local copy was last written.
    pub updated_at: Timestamp,
}

/// Local and remote schema versions, compared at every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Version recorded in the local cache.
    pub local: u32,
    /// Version reported by the remote store.
    pub remote: u32,
}

impl SchemaVersion {
    /// Whether the local cache has reached the remote version.
    pub fn is_current(&self) -> bool {
        self.local == self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_lock_key_is_tenant_scoped() {
        let key = OfflineLock::key_for(&TenantId::new("acme"), &EntityKey::new("invoice", "R1"));
        assert_eq!(key, "acme:invoice/R1");
    }

    #[test]
    fn record_lock_expires_at_boundary() {
        let lock = RecordLock {
            id: LockId::new(),
            tenant_id: TenantId::new("acme"),
            entity: EntityKey::new("invoice", "R1"),
            holder_user_id: UserId::new("alice"),
            holder_device_id: DeviceId::new(),
            expires_at: 1_000,
            created_at: 0,
        };
        assert!(lock.is_live(999));
        assert!(!lock.is_live(1_000));
    }

    #[test]
    fn operation_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&OperationType::Create).unwrap(),
            "\"create\""
        );
    }

    #[test]
    fn schema_version_current() {
        assert!(SchemaVersion { local: 3, remote: 3 }.is_current());
        assert!(!SchemaVersion { local: 2, remote: 3 }.is_current());
    }
}
