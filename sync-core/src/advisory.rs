//! Offline advisory locks.
//!
//! Offline locks are a local promise, never authoritative: they always
//! succeed, carry an expiry capped by a ceiling, and are reconciled against
//! the remote lock table once the device is back online.

use std::collections::BTreeMap;
use sync_types::{EntityKey, OfflineLock, TenantId, Timestamp, UserId};

/// Table of advisory locks, keyed by [`OfflineLock::key_for`].
#[derive(Debug, Clone, Default)]
pub struct OfflineLockTable {
    locks: BTreeMap<String, OfflineLock>,
    ceiling_ms: u64,
}

impl OfflineLockTable {
    /// Create an empty table. No offline lock outlives `ceiling_ms`.
    pub fn new(ceiling_ms: u64) -> Self {
        Self {
            locks: BTreeMap::new(),
            ceiling_ms,
        }
    }

    /// Rebuild a table from persisted locks.
    pub fn from_locks(ceiling_ms: u64, locks: impl IntoIterator<Item = OfflineLock>) -> Self {
        let mut table = Self::new(ceiling_ms);
        for lock in locks {
            table.locks.insert(lock.id.clone(), lock);
        }
        table
    }

    /// Record an advisory lock. Always succeeds.
    ///
    /// Re-acquiring a record replaces the previous entry (same key).
    pub fn acquire(
        &mut self,
        tenant_id: &TenantId,
        entity: &EntityKey,
        user_id: &UserId,
        ttl_ms: u64,
        now: Timestamp,
    ) -> OfflineLock {
        let lock = OfflineLock {
            id: OfflineLock::key_for(tenant_id, entity),
            entity: entity.clone(),
            holder_user_id: user_id.clone(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_ms.min(self.ceiling_ms)),
        };
        self.locks.insert(lock.id.clone(), lock.clone());
        lock
    }

    /// Look up an advisory lock by record.
    pub fn get(&self, tenant_id: &TenantId, entity: &EntityKey) -> Option<&OfflineLock> {
        self.locks.get(&OfflineLock::key_for(tenant_id, entity))
    }

    /// Drop an advisory lock by key.
    pub fn remove(&mut self, key: &str) -> Option<OfflineLock> {
        self.locks.remove(key)
    }

    /// Locks still live at `now`, oldest acquisition first.
    pub fn live(&self, now: Timestamp) -> Vec<OfflineLock> {
        let mut live: Vec<OfflineLock> = self
            .locks
            .values()
            .filter(|l| l.is_live(now))
            .cloned()
            .collect();
        live.sort_by_key(|l| l.acquired_at);
        live
    }

    /// Drop locks that lapsed at or before `now`.
    pub fn purge_expired(&mut self, now: Timestamp) -> Vec<OfflineLock> {
        let expired: Vec<String> = self
            .locks
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| self.locks.remove(key))
            .collect()
    }

    /// All locks, live or not.
    pub fn all(&self) -> impl Iterator<Item = &OfflineLock> {
        self.locks.values()
    }

    /// Number of locks recorded.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no locks are recorded.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
