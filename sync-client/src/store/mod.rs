//! Local store abstraction.
//!
//! The sync core needs only a narrow key-value interface with atomic batches:
//! `get`, `put`, `delete`, `scan_prefix` and `run_in_transaction`. Values are
//! MessagePack-encoded records (see [`keys`] for the layout).
//!
//! Implementations:
//! - [`MemoryStore`]: in-process map with write fault injection (tests, demos)
//! - [`SqliteStore`]: a single `kv` table on SQLite in WAL mode

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or overwrite a value.
    Put {
        /// Key.
        key: String,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Remove a value (no-op if absent).
    Delete {
        /// Key.
        key: String,
    },
}

impl StoreOp {
    /// Encode a record into a `Put`.
    pub fn put<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self, StoreError> {
        Ok(Self::Put {
            key: key.into(),
            value: sync_types::encode(value)?,
        })
    }

    /// A `Delete`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Durable key-value storage owned by this device.
///
/// All writes of one logical change go through [`run_in_transaction`]
/// so that a crash never leaves a half-applied change behind.
///
/// [`run_in_transaction`]: LocalStore::run_in_transaction
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply every op or none of them.
    async fn run_in_transaction(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;
}

/// Read and decode a record.
pub async fn load<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(sync_types::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Read and decode every record under a prefix, in key order.
pub async fn load_prefix<T: DeserializeOwned>(
    store: &dyn LocalStore,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .scan_prefix(prefix)
        .await?
        .iter()
        .map(|(_, bytes)| sync_types::decode(bytes).map_err(StoreError::from))
        .collect()
}

/// Key layout of the local store.
///
/// Queue keys embed the zero-padded queue sequence so that a prefix scan
/// returns entries in enqueue order.
pub mod keys {
    use sync_types::{EntityKey, LockId, TenantId};

    /// Recorded local schema version.
    pub const SCHEMA_VERSION: &str = "meta/schema_version";

    /// Prefix of every queue entry of a tenant.
    pub fn queue_prefix(tenant_id: &TenantId) -> String {
        format!("queue/{tenant_id}/")
    }

    /// Queue entry key.
    pub fn queue_entry(tenant_id: &TenantId, sequence: u64) -> String {
        format!("queue/{tenant_id}/{sequence:020}")
    }

    /// Prefix of every cached record of a tenant.
    pub fn record_prefix(tenant_id: &TenantId) -> String {
        format!("record/{tenant_id}/")
    }

    /// Cached record key.
    pub fn record(tenant_id: &TenantId, entity: &EntityKey) -> String {
        format!("record/{tenant_id}/{}/{}", entity.entity_type, entity.entity_id)
    }

    /// Prefix of every cached record lock of a tenant.
    pub fn lock_prefix(tenant_id: &TenantId) -> String {
        format!("lock/{tenant_id}/")
    }

    /// Cached record lock key.
    pub fn lock(tenant_id: &TenantId, lock_id: &LockId) -> String {
        format!("lock/{tenant_id}/{lock_id}")
    }

    /// Prefix of every offline lock.
    pub const OFFLINE_LOCK_PREFIX: &str = "offline_lock/";

    /// Offline lock key (the lock id is already tenant-scoped).
    pub fn offline_lock(id: &str) -> String {
        format!("{OFFLINE_LOCK_PREFIX}{id}")
    }

    /// Last contiguous change sequence merged for a tenant.
    pub fn change_sequence(tenant_id: &TenantId) -> String {
        format!("meta/sequence/{tenant_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{EntityKey, TenantId};

    #[test]
    fn queue_keys_sort_by_sequence() {
        let tenant = TenantId::new("acme");
        assert!(keys::queue_entry(&tenant, 9) < keys::queue_entry(&tenant, 10));
        assert!(keys::queue_entry(&tenant, 9).starts_with(&keys::queue_prefix(&tenant)));
    }

    #[test]
    fn record_key_contains_entity() {
        let key = keys::record(&TenantId::new("acme"), &EntityKey::new("invoice", "R1"));
        assert_eq!(key, "record/acme/invoice/R1");
    }

    #[tokio::test]
    async fn typed_helpers_roundtrip_through_store() {
        let store = MemoryStore::new();
        let op = StoreOp::put("meta/x", &42u32).unwrap();
        store.run_in_transaction(vec![op]).await.unwrap();

        let value: Option<u32> = load(&store, "meta/x").await.unwrap();
        assert_eq!(value, Some(42));
        let missing: Option<u32> = load(&store, "meta/y").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn load_rejects_corrupt_value() {
        let store = MemoryStore::new();
        store.put("meta/x", vec![0xc1]).await.unwrap();
        let result: Result<Option<u32>, _> = load(&store, "meta/x").await;
        assert!(matches!(result, Err(StoreError::Codec(_))));
    }
}
