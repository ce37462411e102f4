//! Record lock leases.
//!
//! Two pieces live here:
//! - [`LeaseTable`]: the authoritative lock table kept by a remote store. It
//!   guarantees at most one live lease per (tenant, entity type, entity id).
//! - [`LockPhase`]: the client-side lifecycle of one lock,
//!   `Unlocked → Requested → Held → (Renewed)* → Released | Expired`.
//!
//! Both are pure: expiry is always evaluated against a `now` passed in.

use std::collections::HashMap;
use sync_types::{
    DeviceId, EntityKey, LockHolder, LockId, RecordLock, TenantId, Timestamp,
};
use thiserror::Error;

/// Key of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    /// Tenant scope.
    pub tenant_id: TenantId,
    /// Locked record.
    pub entity: EntityKey,
}

/// Lease operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Another holder has a live lease on the record.
    #[error("record locked by {} until {expires_at}", .holder.user_id)]
    Held {
        /// Current holder.
        holder: LockHolder,
        /// When the current lease runs out.
        expires_at: Timestamp,
    },
    /// No lease with this id.
    #[error("lock {0} not found")]
    NotFound(LockId),
    /// The lease ran out before it was renewed.
    #[error("lock {0} expired")]
    Expired(LockId),
    /// The requester does not hold this lease.
    #[error("lock {0} is held by someone else")]
    NotHolder(LockId),
}

/// Authoritative lock table.
#[derive(Debug, Default, Clone)]
pub struct LeaseTable {
    by_key: HashMap<LeaseKey, RecordLock>,
    by_id: HashMap<LockId, LeaseKey>,
}

impl LeaseTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a lease if the record has no live lease.
    ///
    /// A repeated acquire by the current holder (same user and device)
    /// refreshes and returns the existing lease instead of failing.
    pub fn acquire(
        &mut self,
        tenant_id: &TenantId,
        entity: &EntityKey,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, LeaseError> {
        let key = LeaseKey {
            tenant_id: tenant_id.clone(),
            entity: entity.clone(),
        };

        if let Some(existing) = self.by_key.get_mut(&key) {
            if existing.is_live(now) {
                if &existing.holder() == holder {
                    existing.expires_at = now.saturating_add(ttl_ms);
                    return Ok(existing.clone());
                }
                return Err(LeaseError::Held {
                    holder: existing.holder(),
                    expires_at: existing.expires_at,
                });
            }
        }

        // Any previous lease on the key is expired; replace it.
        if let Some(stale) = self.by_key.remove(&key) {
            self.by_id.remove(&stale.id);
        }

        let lock = RecordLock {
            id: LockId::new(),
            tenant_id: tenant_id.clone(),
            entity: entity.clone(),
            holder_user_id: holder.user_id.clone(),
            holder_device_id: holder.device_id,
            expires_at: now.saturating_add(ttl_ms),
            created_at: now,
        };
        self.by_id.insert(lock.id, key.clone());
        self.by_key.insert(key, lock.clone());
        Ok(lock)
    }

    /// Extend a live lease held by `holder`.
    pub fn renew(
        &mut self,
        lock_id: &LockId,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, LeaseError> {
        let lock = self.lookup_mut(lock_id)?;
        if &lock.holder() != holder {
            return Err(LeaseError::NotHolder(*lock_id));
        }
        if !lock.is_live(now) {
            return Err(LeaseError::Expired(*lock_id));
        }
        lock.expires_at = now.saturating_add(ttl_ms);
        Ok(lock.clone())
    }

    /// Drop a lease held by `holder`.
    pub fn release(
        &mut self,
        lock_id: &LockId,
        holder: &LockHolder,
    ) -> Result<RecordLock, LeaseError> {
        let lock = self.lookup_mut(lock_id)?;
        if &lock.holder() != holder {
            return Err(LeaseError::NotHolder(*lock_id));
        }
        self.remove(lock_id).ok_or(LeaseError::NotFound(*lock_id))
    }

    /// Drop every lease held by a device (holder disconnected).
    pub fn release_device(&mut self, device_id: &DeviceId) -> Vec<RecordLock> {
        let ids: Vec<LockId> = self
            .by_key
            .values()
            .filter(|l| &l.holder_device_id == device_id)
            .map(|l| l.id)
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove leases that ran out at or before `now`.
    pub fn purge_expired(&mut self, now: Timestamp) -> Vec<RecordLock> {
        let ids: Vec<LockId> = self
            .by_key
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.id)
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// The live lease on a record, if any.
    pub fn live_lock(
        &self,
        tenant_id: &TenantId,
        entity: &EntityKey,
        now: Timestamp,
    ) -> Option<&RecordLock> {
        let key = LeaseKey {
            tenant_id: tenant_id.clone(),
            entity: entity.clone(),
        };
        self.by_key.get(&key).filter(|l| l.is_live(now))
    }

    /// Number of leases in the table (live or not yet purged).
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn lookup_mut(&mut self, lock_id: &LockId) -> Result<&mut RecordLock, LeaseError> {
        let key = self
            .by_id
            .get(lock_id)
            .ok_or(LeaseError::NotFound(*lock_id))?;
        self.by_key
            .get_mut(key)
            .ok_or(LeaseError::NotFound(*lock_id))
    }

    fn remove(&mut self, lock_id: &LockId) -> Option<RecordLock> {
        let key = self.by_id.remove(lock_id)?;
        self.by_key.remove(&key)
    }
}

/// Client-side lifecycle of one record lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockPhase {
    /// No lock.
    #[default]
    Unlocked,
    /// Acquisition sent, no answer yet.
    Requested,
    /// Lease held.
    Held {
        /// The granted lease.
        lock: RecordLock,
        /// Number of successful renewals.
        renewals: u32,
    },
    /// Released explicitly.
    Released,
    /// Not renewed in time, or the holder disconnected.
    Expired,
}

/// Inputs to [`LockPhase::on_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// Acquisition sent.
    Requested,
    /// Remote granted the lease.
    Granted(RecordLock),
    /// Remote refused (held by someone else) or the request was cancelled.
    Denied,
    /// Renewal succeeded.
    Renewed(RecordLock),
    /// Renewal failed or the lease deadline passed.
    Lapsed,
    /// Released explicitly.
    Released,
}

impl LockPhase {
    /// Apply an event. Invalid transitions leave the phase unchanged.
    pub fn on_event(self, event: LockEvent) -> Self {
        match (self, event) {
            (Self::Unlocked | Self::Released | Self::Expired, LockEvent::Requested) => {
                Self::Requested
            }
            (Self::Requested, LockEvent::Granted(lock)) => Self::Held { lock, renewals: 0 },
            (Self::Requested, LockEvent::Denied) => Self::Unlocked,
            (Self::Held { renewals, .. }, LockEvent::Renewed(lock)) => Self::Held {
                lock,
                renewals: renewals.saturating_add(1),
            },
            (Self::Held { .. }, LockEvent::Lapsed) => Self::Expired,
            (Self::Held { .. } | Self::Requested, LockEvent::Released) => Self::Released,
            (state, _) => state,
        }
    }

    /// The lease, while held.
    pub fn lock(&self) -> Option<&RecordLock> {
        match self {
            Self::Held { lock, .. } => Some(lock),
            _ => None,
        }
    }

    /// Whether the lease is held.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}
