//! Record lock manager.
//!
//! Exclusive, time-bounded leases granted by the remote store. Acquisition
//! needs connectivity; a granted lease is cached in the local store and kept
//! alive by a heartbeat task renewing at a third of the lease. A rejected or
//! late renewal, or losing connectivity, expires the lock locally and
//! announces it on [`RecordLockManager::subscribe_expired`]. A transient
//! renewal failure leaves a still-live lease to the next heartbeat.

use crate::config::SyncConfig;
use crate::error::{ErrorKind, LockError};
use crate::remote::{with_timeout, RemoteStore};
use crate::store::{keys, load_prefix, LocalStore, StoreOp};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sync_core::{ConnectionState, LockEvent, LockPhase};
use sync_types::{
    now_millis, DeviceId, EntityKey, LockId, LockRequest, RecordLock, TenantId, UserId,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct HeldLock {
    phase: LockPhase,
    heartbeat: Option<JoinHandle<()>>,
}

impl HeldLock {
    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

/// Acquires, renews and releases remote record locks for this device.
pub struct RecordLockManager {
    tenant_id: TenantId,
    user_id: UserId,
    device_id: DeviceId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: watch::Receiver<ConnectionState>,
    held: DashMap<LockId, HeldLock>,
    expired: broadcast::Sender<RecordLock>,
    lease_ttl_ms: u64,
    renew_interval: Duration,
    request_timeout: Duration,
    this: Weak<Self>,
}

impl RecordLockManager {
    /// Create a manager.
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: watch::Receiver<ConnectionState>,
    ) -> Arc<Self> {
        let (expired, _) = broadcast::channel(64);
        Arc::new_cyclic(|this| Self {
            tenant_id: config.tenant_id.clone(),
            user_id: config.user_id.clone(),
            device_id: config.device_id,
            store,
            remote,
            connectivity,
            held: DashMap::new(),
            expired,
            lease_ttl_ms: config.lease_ttl_ms,
            renew_interval: config.renew_interval(),
            request_timeout: config.request_timeout(),
            this: this.clone(),
        })
    }

    /// Reload leases cached by a previous run.
    ///
    /// Leases past their deadline are dropped. Live ones get a heartbeat
    /// again; the first renewal tells whether the remote still honours them.
    pub async fn restore(&self) -> Result<Vec<RecordLock>, LockError> {
        let cached: Vec<RecordLock> =
            load_prefix(self.store.as_ref(), &keys::lock_prefix(&self.tenant_id)).await?;
        let now = now_millis();
        let (live, stale): (Vec<_>, Vec<_>) = cached.into_iter().partition(|l| l.is_live(now));

        if !stale.is_empty() {
            let ops = stale
                .iter()
                .map(|l| StoreOp::delete(keys::lock(&self.tenant_id, &l.id)))
                .collect();
            self.store.run_in_transaction(ops).await?;
        }
        for lock in &live {
            let phase = LockPhase::Requested.on_event(LockEvent::Granted(lock.clone()));
            self.track(phase);
        }
        if !live.is_empty() {
            info!(count = live.len(), "restored cached record locks");
        }
        Ok(live)
    }

    /// Acquire the lock on a record.
    ///
    /// Fails with [`LockError::Conflict`] naming the holder when someone else
    /// has it. Re-acquiring a record this device already holds refreshes the
    /// lease.
    pub async fn acquire(&self, entity: &EntityKey) -> Result<RecordLock, LockError> {
        if !self.connectivity.borrow().is_online() {
            return Err(LockError::NotOnline);
        }

        let phase = LockPhase::Unlocked.on_event(LockEvent::Requested);
        let request = self.request(None);
        let lock = match with_timeout(
            self.request_timeout,
            self.remote.acquire_lock(entity, &request),
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                debug!(%entity, error = %e, "lock not granted");
                return Err(e.into());
            }
        };

        self.store
            .run_in_transaction(vec![StoreOp::put(
                keys::lock(&self.tenant_id, &lock.id),
                &lock,
            )?])
            .await?;
        self.track(phase.on_event(LockEvent::Granted(lock.clone())));

        info!(%entity, lock_id = %lock.id, expires_at = lock.expires_at, "record lock acquired");
        Ok(lock)
    }

    /// Start acquiring in the background. The caller may cancel before the
    /// remote answers.
    pub fn begin_acquire(&self, entity: EntityKey) -> PendingAcquire {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let this = self.this.clone();
        let task = tokio::spawn(async move {
            let Some(manager) = this.upgrade() else {
                return Err(LockError::Cancelled);
            };
            if flag.load(Ordering::SeqCst) {
                return Err(LockError::Cancelled);
            }
            let lock = manager.acquire(&entity).await?;
            if flag.load(Ordering::SeqCst) {
                // Granted after the caller gave up.
                if let Err(e) = manager.release(&lock.id).await {
                    debug!(lock_id = %lock.id, error = %e, "release after cancel failed");
                }
                return Err(LockError::Cancelled);
            }
            Ok(lock)
        });
        PendingAcquire { cancelled, task }
    }

    /// Extend a held lease.
    ///
    /// A rejected renewal, or a lease already past its deadline, expires the
    /// lock. Transient failures keep it while the lease is live.
    pub async fn renew(&self, lock_id: &LockId) -> Result<RecordLock, LockError> {
        let lock = self
            .held_lock(lock_id)
            .ok_or(LockError::NotHeld(*lock_id))?;

        if !lock.is_live(now_millis()) {
            self.expire(lock_id, "renewal too late").await?;
            return Err(LockError::Expired(*lock_id));
        }
        if !self.connectivity.borrow().is_online() {
            self.expire(lock_id, "offline").await?;
            return Err(LockError::NotOnline);
        }

        let request = self.request(Some(*lock_id));
        let renewed = match with_timeout(
            self.request_timeout,
            self.remote.renew_lock(&lock.entity, &request),
        )
        .await
        {
            Ok(renewed) => renewed,
            Err(e) if e.kind() == ErrorKind::Transient && lock.is_live(now_millis()) => {
                warn!(%lock_id, error = %e, "lease renewal failed, keeping lock");
                return Err(e.into());
            }
            Err(e) => {
                self.expire(lock_id, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        if let Some(mut held) = self.held.get_mut(lock_id) {
            let phase = std::mem::take(&mut held.phase);
            held.phase = phase.on_event(LockEvent::Renewed(renewed.clone()));
        } else {
            // Released while the renewal was in flight.
            return Err(LockError::NotHeld(*lock_id));
        }
        self.store
            .run_in_transaction(vec![StoreOp::put(
                keys::lock(&self.tenant_id, lock_id),
                &renewed,
            )?])
            .await?;

        debug!(%lock_id, expires_at = renewed.expires_at, "record lock renewed");
        Ok(renewed)
    }

    /// Release a held lock.
    ///
    /// The lock is dropped locally even if the remote cannot be told; the
    /// remote lease then runs out on its own.
    pub async fn release(&self, lock_id: &LockId) -> Result<(), LockError> {
        let (_, mut held) = self
            .held
            .remove(lock_id)
            .ok_or(LockError::NotHeld(*lock_id))?;
        held.stop_heartbeat();
        let Some(lock) = held.phase.lock().cloned() else {
            return Err(LockError::NotHeld(*lock_id));
        };

        self.store
            .run_in_transaction(vec![StoreOp::delete(keys::lock(&self.tenant_id, lock_id))])
            .await?;

        if self.connectivity.borrow().is_online() {
            let request = self.request(Some(*lock_id));
            if let Err(e) = with_timeout(
                self.request_timeout,
                self.remote.release_lock(&lock.entity, &request),
            )
            .await
            {
                warn!(%lock_id, error = %e, "remote release failed, lease will lapse");
            }
        }

        info!(%lock_id, entity = %lock.entity, "record lock released");
        Ok(())
    }

    /// Expire every held lock (the holder went offline).
    pub async fn expire_all(&self) -> Result<Vec<RecordLock>, LockError> {
        let ids: Vec<LockId> = self.held.iter().map(|e| *e.key()).collect();
        let mut expired = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(lock) = self.expire(id, "holder disconnected").await? {
                expired.push(lock);
            }
        }
        Ok(expired)
    }

    /// Locks currently held by this device.
    pub fn held_locks(&self) -> Vec<RecordLock> {
        self.held
            .iter()
            .filter_map(|e| e.phase.lock().cloned())
            .collect()
    }

    /// The lock this device holds on a record, if any.
    pub fn lock_for(&self, entity: &EntityKey) -> Option<RecordLock> {
        self.held
            .iter()
            .find_map(|e| e.phase.lock().filter(|l| &l.entity == entity).cloned())
    }

    /// Notified with every lock that expires instead of being released.
    pub fn subscribe_expired(&self) -> broadcast::Receiver<RecordLock> {
        self.expired.subscribe()
    }

    fn request(&self, lock_id: Option<LockId>) -> LockRequest {
        LockRequest {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id,
            lock_id,
            ttl_ms: self.lease_ttl_ms,
        }
    }

    fn held_lock(&self, lock_id: &LockId) -> Option<RecordLock> {
        self.held.get(lock_id).and_then(|h| h.phase.lock().cloned())
    }

    /// Start tracking a granted lease. A refreshed lease keeps its heartbeat.
    fn track(&self, phase: LockPhase) {
        let Some(lock_id) = phase.lock().map(|l| l.id) else {
            return;
        };
        let mut entry = self.held.entry(lock_id).or_insert_with(|| HeldLock {
            phase: LockPhase::Unlocked,
            heartbeat: None,
        });
        entry.phase = phase;
        if entry.heartbeat.is_none() {
            entry.heartbeat = Some(self.spawn_heartbeat(lock_id));
        }
    }

    fn spawn_heartbeat(&self, lock_id: LockId) -> JoinHandle<()> {
        let this = self.this.clone();
        let interval = self.renew_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = this.upgrade() else {
                    return;
                };
                match manager.renew(&lock_id).await {
                    Ok(_) => {}
                    Err(e)
                        if e.kind() == ErrorKind::Transient
                            && manager.held.contains_key(&lock_id) => {}
                    Err(_) => return,
                }
            }
        })
    }

    /// Drop a lock from the held set and the cache, and announce it.
    async fn expire(
        &self,
        lock_id: &LockId,
        reason: &str,
    ) -> Result<Option<RecordLock>, LockError> {
        let Some((_, mut held)) = self.held.remove(lock_id) else {
            return Ok(None);
        };
        let Some(lock) = held.phase.lock().cloned() else {
            held.stop_heartbeat();
            return Ok(None);
        };

        warn!(%lock_id, entity = %lock.entity, reason, "record lock expired");
        let deleted = self
            .store
            .run_in_transaction(vec![StoreOp::delete(keys::lock(&self.tenant_id, lock_id))])
            .await;
        let _ = self.expired.send(lock.clone());
        // Last: the caller may be this lock's own heartbeat task, which is
        // cancelled at its next await.
        held.stop_heartbeat();
        deleted?;
        Ok(Some(lock))
    }
}

impl Drop for RecordLockManager {
    fn drop(&mut self) {
        for mut entry in self.held.iter_mut() {
            entry.stop_heartbeat();
        }
    }
}

/// A lock acquisition running in the background.
pub struct PendingAcquire {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<Result<RecordLock, LockError>>,
}

impl PendingAcquire {
    /// Give up. A lease granted after this point is released again and the
    /// acquisition resolves to [`LockError::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<RecordLock, LockError> {
        self.task.await.unwrap_or(Err(LockError::Cancelled))
    }
}
