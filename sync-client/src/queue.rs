//! Sync queue.
//!
//! Durable, ordered outbox of local mutations. `enqueue()` never touches the
//! network: it writes the entry and the optimistic cache record in one local
//! transaction. `drain()` replays the queue against the remote store when
//! Online and the schema gate is open.
//!
//! Ordering and retry bookkeeping live in [`MutationQueue`] (sync-core); this
//! module persists every change it makes and performs the remote calls.

use crate::config::SyncConfig;
use crate::error::{ErrorKind, QueueError, RemoteError};
use crate::remote::{with_timeout, RemoteStore};
use crate::store::{keys, load, load_prefix, LocalStore, StoreOp};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{Backoff, ConnectionState, MutationQueue, Resolution, Resolved, RetryDecision};
use sync_types::{
    now_millis, CachedRecord, DeviceId, EntityKey, MutationConflict, MutationId,
    MutationRequest, OperationType, SyncQueueEntry, TenantId, UserId,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// A queue entry that ended up quarantined during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    /// The entry, now `Failed`.
    pub entry: SyncQueueEntry,
    /// Why it was quarantined.
    pub kind: ErrorKind,
    /// The remote's current version and payload, for conflicts.
    pub conflict: Option<MutationConflict>,
}

/// Outcome of one [`SyncQueue::drain`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged by the remote store.
    pub sent: usize,
    /// Entries that failed transiently and will be retried.
    pub retried: usize,
    /// Entries quarantined during this drain.
    pub failed: Vec<DrainFailure>,
    /// Connectivity was lost before the batch finished.
    pub aborted: bool,
    /// Time until the earliest backing-off entry may be sent.
    pub next_retry_in: Option<Duration>,
}

/// Durable outbox for one tenant.
pub struct SyncQueue {
    tenant_id: TenantId,
    user_id: UserId,
    device_id: DeviceId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: watch::Receiver<ConnectionState>,
    gate: watch::Receiver<bool>,
    state: Mutex<MutationQueue>,
    draining: Mutex<()>,
    backoff: Backoff,
    max_retries: u32,
    request_timeout: Duration,
}

impl SyncQueue {
    /// Open the queue, restoring entries persisted by a previous run.
    ///
    /// Entries left `Sending` by a crash are reset to `Pending`.
    pub async fn open(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: watch::Receiver<ConnectionState>,
        gate: watch::Receiver<bool>,
    ) -> Result<Self, QueueError> {
        let persisted: Vec<SyncQueueEntry> =
            load_prefix(store.as_ref(), &keys::queue_prefix(&config.tenant_id)).await?;
        let (queue, reset) = MutationQueue::restore(config.max_queue_size, persisted);

        if !reset.is_empty() {
            info!(count = reset.len(), "resetting interrupted sends");
            let ops = reset
                .iter()
                .map(|e| StoreOp::put(keys::queue_entry(&e.tenant_id, e.sequence), e))
                .collect::<Result<Vec<_>, _>>()?;
            store.run_in_transaction(ops).await?;
        }
        if !queue.is_empty() {
            info!(count = queue.len(), "restored sync queue");
        }

        Ok(Self {
            tenant_id: config.tenant_id.clone(),
            user_id: config.user_id.clone(),
            device_id: config.device_id,
            store,
            remote,
            connectivity,
            gate,
            state: Mutex::new(queue),
            draining: Mutex::new(()),
            backoff: config.backoff(),
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
        })
    }

    /// Record a local mutation.
    ///
    /// Writes the entry and the optimistic cache record atomically. On a
    /// failed write nothing is queued.
    pub async fn enqueue(
        &self,
        operation: OperationType,
        entity: EntityKey,
        payload: Vec<u8>,
    ) -> Result<SyncQueueEntry, QueueError> {
        let record_key = keys::record(&self.tenant_id, &entity);
        let mut state = self.state.lock().await;
        let cached: Option<CachedRecord> = load(self.store.as_ref(), &record_key).await?;
        let now = now_millis();

        let entry = state.enqueue(
            self.tenant_id.clone(),
            operation,
            entity.clone(),
            payload,
            cached.as_ref().and_then(|r| r.version),
            now,
        )?;

        let deleted = operation == OperationType::Delete;
        let optimistic = CachedRecord {
            entity,
            version: cached.and_then(|r| r.version),
            payload: if deleted { Vec::new() } else { entry.payload.clone() },
            deleted,
            updated_at: now,
        };
        let ops = vec![
            StoreOp::put(keys::queue_entry(&self.tenant_id, entry.sequence), &entry)?,
            StoreOp::put(record_key, &optimistic)?,
        ];
        if let Err(e) = self.store.run_in_transaction(ops).await {
            state.withdraw(&entry.id)?;
            return Err(e.into());
        }

        debug!(id = %entry.id, entity = %entry.entity, op = ?operation, "mutation queued");
        Ok(entry)
    }

    /// Send every ready entry to the remote store.
    ///
    /// Requires Online and an open schema gate. Sends the head entry of each
    /// entity in queue order; an entity that is backing off or quarantined
    /// is skipped without holding up the others. Connectivity is re-checked
    /// before each entity. Only one drain runs at a time.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        self.check_can_send()?;
        let _draining = self.draining.lock().await;

        let mut report = DrainReport::default();
        let mut attempted: HashSet<MutationId> = HashSet::new();

        'batches: loop {
            let batch: Vec<SyncQueueEntry> = self
                .state
                .lock()
                .await
                .ready(now_millis())
                .into_iter()
                .filter(|e| !attempted.contains(&e.id))
                .collect();
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                if self.check_can_send().is_err() {
                    report.aborted = true;
                    break 'batches;
                }
                attempted.insert(entry.id);
                if !self.send(entry, &mut report).await? {
                    report.aborted = true;
                    break 'batches;
                }
            }
        }

        report.next_retry_in = self.state.lock().await.next_retry_in(now_millis());
        if report.sent > 0 || !report.failed.is_empty() {
            info!(
                sent = report.sent,
                retried = report.retried,
                failed = report.failed.len(),
                aborted = report.aborted,
                "drain finished"
            );
        }
        Ok(report)
    }

    /// Apply a caller decision to a quarantined entry.
    pub async fn resolve(
        &self,
        id: &MutationId,
        resolution: Resolution,
    ) -> Result<Resolved, QueueError> {
        let mut state = self.state.lock().await;
        let resolved = state.resolve(id, resolution, now_millis())?;

        let mut ops = resolved
            .updated
            .iter()
            .map(|e| StoreOp::put(keys::queue_entry(&e.tenant_id, e.sequence), e))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(discarded) = &resolved.discarded {
            ops.push(StoreOp::delete(keys::queue_entry(
                &discarded.tenant_id,
                discarded.sequence,
            )));
            // A create the remote never saw leaves nothing behind locally.
            if discarded.operation == OperationType::Create
                && state.head_of(&discarded.entity).is_none()
            {
                ops.push(StoreOp::delete(keys::record(
                    &discarded.tenant_id,
                    &discarded.entity,
                )));
            }
        }
        self.store.run_in_transaction(ops).await?;

        info!(%id, ?resolution, "quarantined mutation resolved");
        Ok(resolved)
    }

    /// Quarantined entries, in queue order.
    pub async fn failed(&self) -> Vec<SyncQueueEntry> {
        self.state.lock().await.failed()
    }

    /// Entries not quarantined (pending or in flight), in queue order.
    pub async fn pending(&self) -> Vec<SyncQueueEntry> {
        self.state
            .lock()
            .await
            .entries()
            .filter(|e| !e.is_failed())
            .cloned()
            .collect()
    }

    /// Number of unacknowledged entries, quarantined ones included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether every mutation has been acknowledged.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    fn check_can_send(&self) -> Result<(), QueueError> {
        if !self.connectivity.borrow().is_online() {
            return Err(QueueError::NotOnline);
        }
        if !*self.gate.borrow() {
            return Err(QueueError::SchemaNotReconciled);
        }
        Ok(())
    }

    /// Send one entry. Returns `false` when the remote is unreachable and the
    /// rest of the batch should wait for the next drain.
    async fn send(
        &self,
        entry: SyncQueueEntry,
        report: &mut DrainReport,
    ) -> Result<bool, QueueError> {
        let entry = self.state.lock().await.mark_sending(&entry.id)?;
        self.persist(&entry).await?;

        let request = MutationRequest {
            mutation_id: entry.id,
            tenant_id: entry.tenant_id.clone(),
            operation: entry.operation,
            entity: entry.entity.clone(),
            payload: entry.payload.clone(),
            base_version: entry.base_version,
            user_id: self.user_id.clone(),
            device_id: self.device_id,
        };
        debug!(id = %entry.id, entity = %entry.entity, "sending mutation");
        let result = with_timeout(self.request_timeout, self.remote.apply_mutation(&request)).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(ack) => {
                let (removed, successor) = state.complete(&entry.id, ack.version)?;
                let record_key = keys::record(&self.tenant_id, &removed.entity);
                let cached: Option<CachedRecord> = load(self.store.as_ref(), &record_key).await?;
                let mut record = cached.unwrap_or_else(|| CachedRecord {
                    entity: removed.entity.clone(),
                    version: None,
                    payload: removed.payload.clone(),
                    deleted: removed.operation == OperationType::Delete,
                    updated_at: ack.applied_at,
                });
                // A merged remote change may already be newer than this ack.
                if record.version < Some(ack.version) {
                    record.version = Some(ack.version);
                }

                let mut ops = vec![
                    StoreOp::delete(keys::queue_entry(&self.tenant_id, removed.sequence)),
                    StoreOp::put(record_key, &record)?,
                ];
                if let Some(next) = &successor {
                    ops.push(StoreOp::put(keys::queue_entry(&self.tenant_id, next.sequence), next)?);
                }
                self.store.run_in_transaction(ops).await?;

                debug!(id = %removed.id, version = %ack.version, "mutation acknowledged");
                report.sent += 1;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::Transient => {
                let delay = self.backoff.delay(entry.retry_count.saturating_add(1));
                let (updated, decision) = state.record_transient_failure(
                    &entry.id,
                    &e.to_string(),
                    delay,
                    self.max_retries,
                    now_millis(),
                )?;
                self.persist(&updated).await?;

                match decision {
                    RetryDecision::RetryAt(_) => {
                        warn!(id = %entry.id, error = %e, retry = updated.retry_count, ?delay, "mutation send failed, will retry");
                        report.retried += 1;
                    }
                    RetryDecision::GaveUp => {
                        warn!(id = %entry.id, error = %e, "mutation retries exhausted");
                        report.failed.push(DrainFailure {
                            entry: updated,
                            kind: ErrorKind::Transient,
                            conflict: None,
                        });
                    }
                }
                Ok(!matches!(e, RemoteError::Unreachable(_)))
            }
            Err(e) => {
                let updated = state.quarantine(&entry.id, &e.to_string())?;
                self.persist(&updated).await?;
                warn!(id = %entry.id, entity = %entry.entity, error = %e, "mutation quarantined");

                let kind = e.kind();
                let conflict = match e {
                    RemoteError::MutationConflict(conflict) => Some(conflict),
                    _ => None,
                };
                report.failed.push(DrainFailure {
                    entry: updated,
                    kind,
                    conflict,
                });
                Ok(true)
            }
        }
    }

    async fn persist(&self, entry: &SyncQueueEntry) -> Result<(), QueueError> {
        let op = StoreOp::put(keys::queue_entry(&entry.tenant_id, entry.sequence), entry)?;
        self.store.run_in_transaction(vec![op]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryStore;
    use sync_types::{EntryStatus, Version};

    struct Harness {
        store: MemoryStore,
        remote: MemoryRemote,
        online: watch::Sender<ConnectionState>,
        gate: watch::Sender<bool>,
        queue: SyncQueue,
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_retry(3, Duration::from_millis(1), Duration::from_millis(10))
            .with_retry_jitter(Duration::ZERO)
            .with_request_timeout(Duration::from_millis(200))
    }

    async fn harness_with(store: MemoryStore, remote: MemoryRemote) -> Harness {
        let (online, connectivity) = watch::channel(ConnectionState::Online);
        let (gate, gate_rx) = watch::channel(true);
        let queue = SyncQueue::open(
            &config(),
            Arc::new(store.clone()),
            Arc::new(remote.clone()),
            connectivity,
            gate_rx,
        )
        .await
        .unwrap();
        Harness {
            store,
            remote,
            online,
            gate,
            queue,
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryStore::new(), MemoryRemote::new()).await
    }

    fn invoice(id: &str) -> EntityKey {
        EntityKey::new("invoice", id)
    }

    async fn cached(h: &Harness, id: &str) -> Option<CachedRecord> {
        load(&h.store, &keys::record(&config().tenant_id, &invoice(id)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_writes_entry_and_optimistic_record() {
        let h = harness().await;
        let entry = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), b"{\"amount\":10}".to_vec())
            .await
            .unwrap();

        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.base_version, None);
        assert_eq!(h.queue.len().await, 1);
        let record = cached(&h, "R1").await.unwrap();
        assert_eq!(record.payload, b"{\"amount\":10}");
        assert_eq!(record.version, None);
        assert_eq!(h.remote.applied_count(), 0);
    }

    #[tokio::test]
    async fn failed_write_queues_nothing() {
        let h = harness().await;
        h.store.fail_next_write("disk full");

        let err = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(h.queue.is_empty().await);
        assert!(cached(&h, "R1").await.is_none());
    }

    #[tokio::test]
    async fn drain_replays_same_entity_in_order_and_rebases() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R2"), b"{}".to_vec())
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::Update, invoice("R2"), b"{\"amount\":50}".to_vec())
            .await
            .unwrap();

        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.sent, 2);
        assert!(h.queue.is_empty().await);
        let remote = h.remote.record(&config().tenant_id, &invoice("R2")).unwrap();
        assert_eq!(remote.payload, b"{\"amount\":50}");
        assert_eq!(remote.version, Some(Version::new(2)));
        assert_eq!(cached(&h, "R2").await.unwrap().version, Some(Version::new(2)));
    }

    #[tokio::test]
    async fn late_ack_does_not_roll_back_merged_version() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), b"{}".to_vec())
            .await
            .unwrap();
        let merged = CachedRecord {
            entity: invoice("R1"),
            version: Some(Version::new(7)),
            payload: b"{\"amount\":70}".to_vec(),
            deleted: false,
            updated_at: 5_000,
        };
        h.store
            .run_in_transaction(vec![StoreOp::put(
                keys::record(&config().tenant_id, &invoice("R1")),
                &merged,
            )
            .unwrap()])
            .await
            .unwrap();

        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.sent, 1);
        let record = cached(&h, "R1").await.unwrap();
        assert_eq!(record.version, Some(Version::new(7)));
        assert_eq!(record.payload, b"{\"amount\":70}");
    }

    #[tokio::test]
    async fn drain_requires_online_and_open_gate() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();

        h.gate.send_replace(false);
        assert!(matches!(
            h.queue.drain().await,
            Err(QueueError::SchemaNotReconciled)
        ));

        h.online.send_replace(ConnectionState::Reconnecting);
        assert!(matches!(h.queue.drain().await, Err(QueueError::NotOnline)));
        assert_eq!(h.remote.applied_count(), 0);
    }

    #[tokio::test]
    async fn lost_ack_is_resent_with_same_id_and_applied_once() {
        let h = harness().await;
        let entry = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), vec![1])
            .await
            .unwrap();
        h.remote.drop_next_ack();

        let first = h.queue.drain().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(h.queue.len().await, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = h.queue.drain().await.unwrap();

        assert_eq!(second.sent, 1);
        assert_eq!(h.remote.received_mutations(), vec![entry.id, entry.id]);
        assert_eq!(h.remote.applied_count(), 1);
        assert_eq!(
            h.remote.record(&config().tenant_id, &invoice("R1")).unwrap().version,
            Some(Version::new(1))
        );
    }

    #[tokio::test]
    async fn transient_failure_does_not_block_other_entities() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::Create, invoice("R2"), vec![])
            .await
            .unwrap();
        h.remote.fail_next_mutation("overloaded");

        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.sent, 1);
        assert!(report.next_retry_in.is_some());
        assert!(h.remote.record(&config().tenant_id, &invoice("R2")).is_some());
    }

    #[tokio::test]
    async fn conflict_quarantines_entry_and_its_successors() {
        let h = harness().await;
        // Someone else created R1 first.
        let other = harness_with(MemoryStore::new(), h.remote.clone()).await;
        other
            .queue
            .enqueue(OperationType::Create, invoice("R1"), b"theirs".to_vec())
            .await
            .unwrap();
        other.queue.drain().await.unwrap();

        let create = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), b"mine".to_vec())
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::Update, invoice("R1"), b"mine2".to_vec())
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::Create, invoice("R3"), vec![])
            .await
            .unwrap();

        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.failed.len(), 1);
        let failure = &report.failed[0];
        assert_eq!(failure.entry.id, create.id);
        assert_eq!(failure.kind, ErrorKind::Conflict);
        let conflict = failure.conflict.as_ref().unwrap();
        assert_eq!(conflict.current_version, Some(Version::new(1)));
        assert_eq!(conflict.current_payload.as_deref(), Some(&b"theirs"[..]));
        assert_eq!(h.queue.failed().await.len(), 1);
        assert_eq!(h.queue.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();
        h.remote.reject_next_mutation("amount must be positive");

        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.failed[0].kind, ErrorKind::Permanent);
        assert_eq!(
            report.failed[0].entry.last_error.as_deref(),
            Some("rejected: amount must be positive")
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_failure() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();

        let mut failed = Vec::new();
        for _ in 0..4 {
            h.remote.fail_next_mutation("overloaded");
            tokio::time::sleep(Duration::from_millis(20)).await;
            failed.extend(h.queue.drain().await.unwrap().failed);
        }

        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ErrorKind::Transient);
        assert_eq!(failed[0].entry.retry_count, 4);
    }

    #[tokio::test]
    async fn overwrite_resolution_resends_on_remote_version() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), b"v1".to_vec())
            .await
            .unwrap();
        h.queue.drain().await.unwrap();

        // Another device updates R1 to version 2.
        let request = MutationRequest {
            mutation_id: MutationId::new(),
            tenant_id: config().tenant_id,
            operation: OperationType::Update,
            entity: invoice("R1"),
            payload: b"theirs".to_vec(),
            base_version: Some(Version::new(1)),
            user_id: UserId::new("bob"),
            device_id: DeviceId::new(),
        };
        h.remote.apply_mutation(&request).await.unwrap();

        let mine = h
            .queue
            .enqueue(OperationType::Update, invoice("R1"), b"mine".to_vec())
            .await
            .unwrap();
        let report = h.queue.drain().await.unwrap();
        let current = report.failed[0].conflict.as_ref().unwrap().current_version.unwrap();

        h.queue
            .resolve(&mine.id, Resolution::Overwrite { base_version: current })
            .await
            .unwrap();
        let report = h.queue.drain().await.unwrap();

        assert_eq!(report.sent, 1);
        let remote = h.remote.record(&config().tenant_id, &invoice("R1")).unwrap();
        assert_eq!(remote.payload, b"mine");
        assert_eq!(remote.version, Some(Version::new(3)));
    }

    #[tokio::test]
    async fn discarding_unsent_create_clears_cache() {
        let h = harness().await;
        let entry = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();
        h.remote.reject_next_mutation("invalid");
        h.queue.drain().await.unwrap();

        let resolved = h.queue.resolve(&entry.id, Resolution::Discard).await.unwrap();

        assert_eq!(resolved.discarded.unwrap().id, entry.id);
        assert!(h.queue.is_empty().await);
        assert!(cached(&h, "R1").await.is_none());
    }

    #[tokio::test]
    async fn reopen_restores_queue_order() {
        let h = harness().await;
        let a = h
            .queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();
        let b = h
            .queue
            .enqueue(OperationType::Update, invoice("R1"), vec![2])
            .await
            .unwrap();

        let reopened = harness_with(h.store.clone(), h.remote.clone()).await;
        let ids: Vec<MutationId> = reopened.queue.pending().await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        reopened.queue.drain().await.unwrap();
        assert!(reopened.queue.is_empty().await);
    }

    #[tokio::test]
    async fn unreachable_remote_aborts_batch() {
        let h = harness().await;
        h.queue
            .enqueue(OperationType::Create, invoice("R1"), vec![])
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::Create, invoice("R2"), vec![])
            .await
            .unwrap();
        h.remote.set_reachable(false);

        let report = h.queue.drain().await.unwrap();

        assert!(report.aborted);
        assert_eq!(report.retried, 1);
        assert_eq!(h.queue.len().await, 2);
    }
}
