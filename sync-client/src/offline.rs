//! Offline lock manager.
//!
//! Advisory locks taken while the remote store is unreachable. They always
//! succeed locally and are never authoritative: on reconnect each live one is
//! turned into a real [`RecordLock`] through the [`RecordLockManager`] or
//! discarded, and every discard is reported.

use crate::config::SyncConfig;
use crate::error::{ErrorKind, LockError};
use crate::locks::RecordLockManager;
use crate::store::{keys, load_prefix, LocalStore, StoreOp};
use std::sync::Arc;
use sync_core::OfflineLockTable;
use sync_types::{
    now_millis, EntityKey, LockHolder, OfflineLock, RecordLock, TenantId, Timestamp, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An offline lock that lost reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedLock {
    /// The advisory lock, now removed.
    pub lock: OfflineLock,
    /// Who holds the record remotely, when it was a conflict.
    pub holder: Option<LockHolder>,
    /// When the remote holder's lease runs out, when it was a conflict.
    pub holder_expires_at: Option<Timestamp>,
    /// Why the lock was discarded.
    pub reason: String,
}

/// Outcome of [`OfflineLockManager::reconcile_on_reconnect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Offline locks now backed by a remote lease.
    pub promoted: Vec<RecordLock>,
    /// Offline locks that could not become remote leases.
    pub discarded: Vec<DiscardedLock>,
    /// Offline locks kept for the next reconnect after a transient failure.
    pub deferred: Vec<OfflineLock>,
    /// Offline locks that lapsed before the reconnect.
    pub purged: Vec<OfflineLock>,
}

/// Advisory locks for one tenant, persisted in the local store.
pub struct OfflineLockManager {
    tenant_id: TenantId,
    store: Arc<dyn LocalStore>,
    table: Mutex<OfflineLockTable>,
    reconciling: Mutex<()>,
    default_ttl_ms: u64,
}

impl OfflineLockManager {
    /// Open the manager, reloading locks taken by a previous run.
    pub async fn open(config: &SyncConfig, store: Arc<dyn LocalStore>) -> Result<Self, LockError> {
        let scope = format!("{}:", config.tenant_id);
        let persisted: Vec<OfflineLock> =
            load_prefix(store.as_ref(), keys::OFFLINE_LOCK_PREFIX).await?;
        let table = OfflineLockTable::from_locks(
            config.offline_lock_ceiling_ms,
            persisted.into_iter().filter(|l| l.id.starts_with(&scope)),
        );

        Ok(Self {
            tenant_id: config.tenant_id.clone(),
            store,
            table: Mutex::new(table),
            reconciling: Mutex::new(()),
            default_ttl_ms: config.offline_lock_ttl_ms,
        })
    }

    /// Record an advisory lock with the default lifetime. Always succeeds
    /// unless the local store fails.
    pub async fn acquire_offline(
        &self,
        entity: &EntityKey,
        user_id: &UserId,
    ) -> Result<OfflineLock, LockError> {
        self.acquire_offline_for(entity, user_id, self.default_ttl_ms)
            .await
    }

    /// Record an advisory lock for `ttl_ms`, capped by the configured ceiling.
    pub async fn acquire_offline_for(
        &self,
        entity: &EntityKey,
        user_id: &UserId,
        ttl_ms: u64,
    ) -> Result<OfflineLock, LockError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let lock = next.acquire(&self.tenant_id, entity, user_id, ttl_ms, now_millis());
        self.store
            .run_in_transaction(vec![StoreOp::put(keys::offline_lock(&lock.id), &lock)?])
            .await?;
        *table = next;

        debug!(%entity, expires_at = lock.expires_at, "offline lock recorded");
        Ok(lock)
    }

    /// Drop an advisory lock.
    pub async fn release_offline(
        &self,
        entity: &EntityKey,
    ) -> Result<Option<OfflineLock>, LockError> {
        let key = OfflineLock::key_for(&self.tenant_id, entity);
        let mut table = self.table.lock().await;
        if table.get(&self.tenant_id, entity).is_none() {
            return Ok(None);
        }
        self.store
            .run_in_transaction(vec![StoreOp::delete(keys::offline_lock(&key))])
            .await?;
        Ok(table.remove(&key))
    }

    /// The advisory lock on a record, if live.
    pub async fn get(&self, entity: &EntityKey) -> Option<OfflineLock> {
        let now = now_millis();
        self.table
            .lock()
            .await
            .get(&self.tenant_id, entity)
            .filter(|l| l.is_live(now))
            .cloned()
    }

    /// Live advisory locks, oldest first.
    pub async fn live(&self) -> Vec<OfflineLock> {
        self.table.lock().await.live(now_millis())
    }

    /// Turn advisory locks into remote leases after a reconnect.
    ///
    /// Lapsed locks are purged without a remote call. Each live lock goes
    /// through [`RecordLockManager::acquire`]: granted locks are promoted, a
    /// conflict or a permanent refusal discards the lock and reports it, and a
    /// transient failure keeps it for the next reconnect.
    pub async fn reconcile_on_reconnect(
        &self,
        locks: &RecordLockManager,
    ) -> Result<ReconcileReport, LockError> {
        let _reconciling = self.reconciling.lock().await;
        let mut report = ReconcileReport::default();

        let live = {
            let mut table = self.table.lock().await;
            let now = now_millis();
            report.purged = table.purge_expired(now);
            if !report.purged.is_empty() {
                let ops = report
                    .purged
                    .iter()
                    .map(|l| StoreOp::delete(keys::offline_lock(&l.id)))
                    .collect();
                self.store.run_in_transaction(ops).await?;
                debug!(count = report.purged.len(), "purged lapsed offline locks");
            }
            table.live(now)
        };

        for offline in live {
            match locks.acquire(&offline.entity).await {
                Ok(lock) => {
                    self.forget(&offline).await?;
                    info!(entity = %offline.entity, lock_id = %lock.id, "offline lock promoted");
                    report.promoted.push(lock);
                }
                Err(LockError::Conflict { holder, expires_at }) => {
                    self.forget(&offline).await?;
                    warn!(entity = %offline.entity, holder = %holder.user_id, "offline lock lost to another holder");
                    report.discarded.push(DiscardedLock {
                        lock: offline,
                        reason: format!("record locked by {}", holder.user_id),
                        holder: Some(holder),
                        holder_expires_at: Some(expires_at),
                    });
                }
                Err(e @ LockError::Store(_)) => return Err(e),
                Err(e) if e.kind() == ErrorKind::Transient => {
                    debug!(entity = %offline.entity, error = %e, "offline lock deferred");
                    report.deferred.push(offline);
                }
                Err(e) => {
                    self.forget(&offline).await?;
                    warn!(entity = %offline.entity, error = %e, "offline lock discarded");
                    report.discarded.push(DiscardedLock {
                        lock: offline,
                        holder: None,
                        holder_expires_at: None,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Remove a reconciled lock unless it was re-taken meanwhile.
    async fn forget(&self, reconciled: &OfflineLock) -> Result<(), LockError> {
        let mut table = self.table.lock().await;
        let unchanged = table
            .get(&self.tenant_id, &reconciled.entity)
            .is_some_and(|current| current.acquired_at == reconciled.acquired_at);
        if unchanged {
            self.store
                .run_in_transaction(vec![StoreOp::delete(keys::offline_lock(&reconciled.id))])
                .await?;
            table.remove(&reconciled.id);
        }
        Ok(())
    }
}
