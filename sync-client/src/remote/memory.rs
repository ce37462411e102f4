//! In-process remote store for testing.
//!
//! Behaves like the relay: idempotent mutations with version checks, a lease
//! table, a per-tenant change log and a broadcast of applied changes for
//! [`MemoryChannel`](crate::channel::MemoryChannel). Reachability, latency,
//! the clock and individual failures can be controlled from the test.

use super::RemoteStore;
use crate::error::RemoteError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_core::LeaseTable;
use sync_types::{
    now_millis, CachedRecord, ChangeNotification, ChangesPage, DeviceId, EntityKey,
    HealthResponse, LockHolder, LockRequest, MutationAck, MutationConflict, MutationId,
    MutationRequest, OperationType, RecordLock, Sequence, TenantId, Timestamp, Version,
};
use tokio::sync::{broadcast, watch};

/// In-process authoritative store.
///
/// Clones share state: hand one clone to each simulated device.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Mutex<MemoryRemoteInner>>,
    changes: broadcast::Sender<ChangeNotification>,
    reachable: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct MemoryRemoteInner {
    schema_version: u32,
    leases: LeaseTable,
    entities: HashMap<(TenantId, EntityKey), CachedRecord>,
    acks: HashMap<MutationId, MutationAck>,
    log: Vec<ChangeNotification>,
    sequences: HashMap<TenantId, Sequence>,
    received: Vec<MutationId>,
    clock_offset_ms: u64,
    latency: Duration,
    drop_next_ack: bool,
    fail_next_mutation: Option<String>,
    reject_next_mutation: Option<String>,
    fail_next_renew: Option<String>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("reachable", &*self.reachable.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create a reachable remote at schema version 1.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        let (reachable, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(MemoryRemoteInner {
                schema_version: 1,
                ..Default::default()
            })),
            changes,
            reachable: Arc::new(reachable),
        }
    }

    /// Simulate the network coming and going.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_replace(reachable);
    }

    /// Whether requests currently reach the store.
    pub fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    /// Change the remote schema version.
    pub fn set_schema_version(&self, version: u32) {
        self.lock().schema_version = version;
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Move the store's clock forward (lease expiry).
    pub fn advance_clock(&self, by: Duration) {
        let mut inner = self.lock();
        inner.clock_offset_ms = inner.clock_offset_ms.saturating_add(by.as_millis() as u64);
    }

    /// Apply the next new mutation but lose its acknowledgment (timeout).
    pub fn drop_next_ack(&self) {
        self.lock().drop_next_ack = true;
    }

    /// Fail the next new mutation with a 503 without applying it.
    pub fn fail_next_mutation(&self, error: &str) {
        self.lock().fail_next_mutation = Some(error.to_string());
    }

    /// Reject the next new mutation with a validation error.
    pub fn reject_next_mutation(&self, reason: &str) {
        self.lock().reject_next_mutation = Some(reason.to_string());
    }

    /// Fail the next lease renewal with a 503.
    pub fn fail_next_renew(&self, error: &str) {
        self.lock().fail_next_renew = Some(error.to_string());
    }

    /// Canonical copy of a record.
    pub fn record(&self, tenant_id: &TenantId, entity: &EntityKey) -> Option<CachedRecord> {
        self.lock()
            .entities
            .get(&(tenant_id.clone(), entity.clone()))
            .cloned()
    }

    /// Number of distinct mutations applied.
    pub fn applied_count(&self) -> usize {
        self.lock().acks.len()
    }

    /// Every mutation id received, duplicates included, in arrival order.
    pub fn received_mutations(&self) -> Vec<MutationId> {
        self.lock().received.clone()
    }

    /// The live lease on a record.
    pub fn live_lock(&self, tenant_id: &TenantId, entity: &EntityKey) -> Option<RecordLock> {
        let mut inner = self.lock();
        let now = inner.now();
        inner.leases.purge_expired(now);
        inner.leases.live_lock(tenant_id, entity, now).cloned()
    }

    /// Drop every lease of a device (server-side heartbeat timeout).
    pub fn release_device(&self, device_id: &DeviceId) -> Vec<RecordLock> {
        self.lock().leases.release_device(device_id)
    }

    /// Highest change sequence of a tenant.
    pub fn max_sequence(&self, tenant_id: &TenantId) -> Sequence {
        self.lock()
            .sequences
            .get(tenant_id)
            .copied()
            .unwrap_or_else(Sequence::zero)
    }

    pub(crate) fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    pub(crate) fn watch_reachable(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_reachable() {
            return Err(RemoteError::Unreachable("network down".into()));
        }
        Ok(())
    }
}

impl MemoryRemoteInner {
    fn now(&self) -> Timestamp {
        now_millis().saturating_add(self.clock_offset_ms)
    }

    fn holder(request: &LockRequest) -> LockHolder {
        LockHolder {
            user_id: request.user_id.clone(),
            device_id: request.device_id,
        }
    }

    fn apply(
        &mut self,
        request: &MutationRequest,
    ) -> Result<(MutationAck, ChangeNotification), RemoteError> {
        if request.entity.entity_type.is_empty() || request.entity.entity_id.is_empty() {
            return Err(RemoteError::Rejected("entity type and id are required".into()));
        }

        let key = (request.tenant_id.clone(), request.entity.clone());
        let current = self.entities.get(&key);
        let current_version = current.and_then(|r| r.version);
        let conflict = match request.operation {
            OperationType::Create => current.is_some_and(|r| !r.deleted),
            OperationType::Update | OperationType::Delete => {
                current_version != request.base_version
            }
        };
        if conflict {
            return Err(RemoteError::MutationConflict(MutationConflict {
                mutation_id: request.mutation_id,
                current_version,
                current_payload: current.map(|r| r.payload.clone()),
            }));
        }

        let now = self.now();
        let version = current_version.map_or(Version::new(1), |v| v.next());
        let sequence = self
            .sequences
            .get(&request.tenant_id)
            .copied()
            .unwrap_or_else(Sequence::zero)
            .next();
        self.sequences.insert(request.tenant_id.clone(), sequence);

        let deleted = request.operation == OperationType::Delete;
        let payload = if deleted { Vec::new() } else { request.payload.clone() };
        self.entities.insert(
            key,
            CachedRecord {
                entity: request.entity.clone(),
                version: Some(version),
                payload: payload.clone(),
                deleted,
                updated_at: now,
            },
        );

        let ack = MutationAck {
            mutation_id: request.mutation_id,
            version,
            applied_at: now,
            sequence,
        };
        self.acks.insert(request.mutation_id, ack.clone());

        let change = ChangeNotification {
            tenant_id: request.tenant_id.clone(),
            entity: request.entity.clone(),
            operation: request.operation,
            version,
            sequence,
            payload,
            origin_user_id: request.user_id.clone(),
            origin_device_id: request.device_id,
            mutation_id: request.mutation_id,
        };
        self.log.push(change.clone());
        Ok((ack, change))
    }
}

fn required_lock_id(request: &LockRequest) -> Result<sync_types::LockId, RemoteError> {
    request
        .lock_id
        .ok_or_else(|| RemoteError::Rejected("lock_id is required".into()))
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn health(&self) -> Result<HealthResponse, RemoteError> {
        self.enter().await?;
        Ok(HealthResponse {
            status: "ok".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            uptime_seconds: 0,
        })
    }

    async fn apply_mutation(&self, request: &MutationRequest) -> Result<MutationAck, RemoteError> {
        self.enter().await?;
        let (ack, change, drop_ack) = {
            let mut inner = self.lock();
            inner.received.push(request.mutation_id);

            if let Some(ack) = inner.acks.get(&request.mutation_id) {
                return Ok(ack.clone());
            }
            if let Some(error) = inner.fail_next_mutation.take() {
                return Err(RemoteError::Server {
                    status: 503,
                    message: error,
                });
            }
            if let Some(reason) = inner.reject_next_mutation.take() {
                return Err(RemoteError::Rejected(reason));
            }

            let (ack, change) = inner.apply(request)?;
            let drop_ack = std::mem::take(&mut inner.drop_next_ack);
            (ack, change, drop_ack)
        };

        // No subscribers is fine
        let _ = self.changes.send(change);

        if drop_ack {
            return Err(RemoteError::Timeout);
        }
        Ok(ack)
    }

    async fn acquire_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError> {
        self.enter().await?;
        let mut inner = self.lock();
        let now = inner.now();
        let holder = MemoryRemoteInner::holder(request);
        Ok(inner
            .leases
            .acquire(&request.tenant_id, entity, &holder, request.ttl_ms, now)?)
    }

    async fn renew_lock(
        &self,
        _entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError> {
        self.enter().await?;
        let lock_id = required_lock_id(request)?;
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_renew.take() {
            return Err(RemoteError::Server {
                status: 503,
                message: error,
            });
        }
        let now = inner.now();
        let holder = MemoryRemoteInner::holder(request);
        Ok(inner.leases.renew(&lock_id, &holder, request.ttl_ms, now)?)
    }

    async fn release_lock(
        &self,
        _entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<(), RemoteError> {
        self.enter().await?;
        let lock_id = required_lock_id(request)?;
        let holder = MemoryRemoteInner::holder(request);
        self.lock().leases.release(&lock_id, &holder)?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32, RemoteError> {
        self.enter().await?;
        Ok(self.lock().schema_version)
    }

    async fn changes_since(
        &self,
        tenant_id: &TenantId,
        after: Sequence,
        limit: u32,
    ) -> Result<ChangesPage, RemoteError> {
        self.enter().await?;
        let inner = self.lock();
        let mut matching = inner
            .log
            .iter()
            .filter(|c| &c.tenant_id == tenant_id && c.sequence > after);
        let changes: Vec<ChangeNotification> =
            matching.by_ref().take(limit as usize).cloned().collect();
        let has_more = matching.next().is_some();
        Ok(ChangesPage {
            changes,
            max_sequence: inner
                .sequences
                .get(tenant_id)
                .copied()
                .unwrap_or_else(Sequence::zero),
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{LockId, UserId};

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn mutation(op: OperationType, id: &str, base: Option<u64>) -> MutationRequest {
        MutationRequest {
            mutation_id: MutationId::new(),
            tenant_id: tenant(),
            operation: op,
            entity: EntityKey::new("invoice", id),
            payload: b"{}".to_vec(),
            base_version: base.map(Version::new),
            user_id: UserId::new("alice"),
            device_id: DeviceId::new(),
        }
    }

    fn lock_request(user: &str, device: DeviceId, lock_id: Option<LockId>) -> LockRequest {
        LockRequest {
            tenant_id: tenant(),
            user_id: UserId::new(user),
            device_id: device,
            lock_id,
            ttl_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn create_then_update_assigns_versions() {
        let remote = MemoryRemote::new();
        let ack = remote
            .apply_mutation(&mutation(OperationType::Create, "R1", None))
            .await
            .unwrap();
        assert_eq!(ack.version, Version::new(1));
        assert_eq!(ack.sequence, Sequence::new(1));

        let ack = remote
            .apply_mutation(&mutation(OperationType::Update, "R1", Some(1)))
            .await
            .unwrap();
        assert_eq!(ack.version, Version::new(2));
    }

    #[tokio::test]
    async fn replay_returns_original_ack() {
        let remote = MemoryRemote::new();
        let request = mutation(OperationType::Create, "R1", None);
        let first = remote.apply_mutation(&request).await.unwrap();
        let second = remote.apply_mutation(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.applied_count(), 1);
        assert_eq!(remote.received_mutations().len(), 2);
    }

    #[tokio::test]
    async fn stale_base_conflicts_with_current_state() {
        let remote = MemoryRemote::new();
        remote
            .apply_mutation(&mutation(OperationType::Create, "R1", None))
            .await
            .unwrap();
        remote
            .apply_mutation(&mutation(OperationType::Update, "R1", Some(1)))
            .await
            .unwrap();

        let err = remote
            .apply_mutation(&mutation(OperationType::Update, "R1", Some(1)))
            .await
            .unwrap_err();
        match err {
            RemoteError::MutationConflict(conflict) => {
                assert_eq!(conflict.current_version, Some(Version::new(2)));
                assert!(conflict.current_payload.is_some());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_ack_still_applies() {
        let remote = MemoryRemote::new();
        remote.drop_next_ack();
        let request = mutation(OperationType::Create, "R1", None);
        assert!(matches!(
            remote.apply_mutation(&request).await,
            Err(RemoteError::Timeout)
        ));
        assert_eq!(remote.applied_count(), 1);

        // The retry is recognised
        let ack = remote.apply_mutation(&request).await.unwrap();
        assert_eq!(ack.version, Version::new(1));
        assert_eq!(remote.applied_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_refuses_everything() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);
        assert!(matches!(
            remote.health().await,
            Err(RemoteError::Unreachable(_))
        ));
        remote.set_reachable(true);
        assert!(remote.health().await.is_ok());
    }

    #[tokio::test]
    async fn lock_conflict_names_holder() {
        let remote = MemoryRemote::new();
        let entity = EntityKey::new("invoice", "R1");
        remote
            .acquire_lock(&entity, &lock_request("alice", DeviceId::new(), None))
            .await
            .unwrap();

        let err = remote
            .acquire_lock(&entity, &lock_request("bob", DeviceId::new(), None))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RemoteError::LockHeld { ref holder, .. } if holder.user_id == UserId::new("alice"))
        );
    }

    #[tokio::test]
    async fn lease_expires_with_clock() {
        let remote = MemoryRemote::new();
        let entity = EntityKey::new("invoice", "R1");
        let alice = DeviceId::new();
        let lock = remote
            .acquire_lock(&entity, &lock_request("alice", alice, None))
            .await
            .unwrap();

        remote.advance_clock(Duration::from_secs(2));
        assert!(remote.live_lock(&tenant(), &entity).is_none());
        let err = remote
            .renew_lock(&entity, &lock_request("alice", alice, Some(lock.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn changes_since_pages() {
        let remote = MemoryRemote::new();
        for id in ["A", "B", "C"] {
            remote
                .apply_mutation(&mutation(OperationType::Create, id, None))
                .await
                .unwrap();
        }

        let page = remote
            .changes_since(&tenant(), Sequence::new(1), 1)
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].entity.entity_id, "B");
        assert!(page.has_more);
        assert_eq!(page.max_sequence, Sequence::new(3));
    }
}
