//! SyncEngine - the caller-facing interface of offsync.
//!
//! The engine owns the six components and drives the reconnect sequence
//! through the pure [`SyncPhase`] state machine from sync-core.
//!
//! # Architecture
//!
//! ```text
//! ConnectionMonitor ─┐
//! caller API ────────┼─→ driver task ─→ SyncPhase::on_event ─→ actions
//! timers/results ────┘                                          │
//!        ↑                                                      ↓
//!        └──── SchemaSyncService / SyncQueue / OfflineLockManager /
//!              RecordLockManager / RealtimeSyncHandler ←────────┘
//! ```
//!
//! Actions run as separate tasks and report back with an event. Results from
//! an earlier connection (before the latest online/offline transition) are
//! dropped.
//!
//! # Example
//!
//! ```ignore
//! use offsync_client::{MemoryStore, HttpRemote, SyncConfig, SyncEngine};
//!
//! let engine = SyncEngine::open(config, store, remote, channel, vec![]).await?;
//! engine.start()?;
//! engine.enqueue_mutation("invoice", "R2", OperationType::Create, payload).await?;
//! let lock = engine.acquire_lock("invoice", "R1").await?;
//! ```

use crate::channel::RealtimeChannel;
use crate::config::SyncConfig;
use crate::error::{EngineError, ErrorKind, LockError};
use crate::locks::RecordLockManager;
use crate::monitor::ConnectionMonitor;
use crate::offline::{DiscardedLock, OfflineLockManager};
use crate::queue::{DrainFailure, SyncQueue};
use crate::realtime::{ChangeRouter, ChangeSink, RealtimeEvent, RealtimeSyncHandler};
use crate::remote::RemoteStore;
use crate::schema::{Migration, SchemaSyncService};
use crate::store::LocalStore;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use sync_core::{Action, Backoff, ConnectionState, Event, Notice, Resolution, Resolved, SyncPhase};
use sync_types::{
    EntityKey, MutationId, OfflineLock, OperationType, RecordLock, SyncQueueEntry,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the engine tells the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Connectivity came back; the reconnect sequence started.
    Online,
    /// Connectivity was lost.
    Offline,
    /// Reconnect sequence finished: schema reconciled, queue drained, offline
    /// locks reconciled.
    Synced,
    /// A schema check failed and will be retried.
    SchemaCheckFailed {
        /// Which attempt failed.
        attempt: u32,
        /// What went wrong.
        error: String,
    },
    /// Queue entries were quarantined and need a [`Resolution`].
    DrainFailures(Vec<DrainFailure>),
    /// A record lock was lost.
    LockExpired(RecordLock),
    /// An offline lock could not become a remote lease.
    OfflineLockDiscarded(DiscardedLock),
    /// The engine stopped on a fatal error.
    Halted {
        /// What went wrong.
        reason: String,
    },
}

/// A lock returned by [`SyncEngine::acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockHandle {
    /// Remote lease, exclusive across devices.
    Remote(RecordLock),
    /// Advisory lock taken while offline; reconciled on reconnect.
    Offline(OfflineLock),
}

impl LockHandle {
    /// Whether this is an exclusive remote lease.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

enum DriverMsg {
    /// Applies whatever the connection epoch.
    Event(Event),
    /// Result of an action started in `epoch`.
    Result { epoch: u64, event: Event },
}

struct EngineInner {
    config: SyncConfig,
    monitor: Arc<ConnectionMonitor>,
    schema: Arc<SchemaSyncService>,
    queue: SyncQueue,
    locks: Arc<RecordLockManager>,
    offline: OfflineLockManager,
    realtime: Arc<RealtimeSyncHandler>,
    router: Arc<ChangeRouter>,
    events: broadcast::Sender<EngineEvent>,
    driver: mpsc::UnboundedSender<DriverMsg>,
    phase: watch::Sender<SyncPhase>,
    backoff: Backoff,
}

/// Local-first sync engine for one tenant, user and device.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<DriverMsg>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    halted: Arc<RwLock<Option<String>>>,
}

impl SyncEngine {
    /// Build the engine and restore the queue and locks persisted by a
    /// previous run. Nothing talks to the remote until [`start`](Self::start).
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        channel: Arc<dyn RealtimeChannel>,
        migrations: Vec<Arc<dyn Migration>>,
    ) -> Result<Self, EngineError> {
        let monitor = ConnectionMonitor::new(remote.clone(), &config);
        let schema = Arc::new(SchemaSyncService::new(
            store.clone(),
            remote.clone(),
            migrations,
            config.request_timeout(),
        ));
        let queue = SyncQueue::open(
            &config,
            store.clone(),
            remote.clone(),
            monitor.subscribe(),
            schema.gate(),
        )
        .await?;
        let locks =
            RecordLockManager::new(&config, store.clone(), remote.clone(), monitor.subscribe());
        let restored = locks.restore().await?;
        if !restored.is_empty() {
            info!(count = restored.len(), "restored record locks");
        }
        let offline = OfflineLockManager::open(&config, store.clone()).await?;
        let router = Arc::new(ChangeRouter::new());
        let realtime = RealtimeSyncHandler::new(
            &config,
            store,
            remote,
            channel,
            Some(router.clone() as Arc<dyn ChangeSink>),
        );

        let (events, _) = broadcast::channel(256);
        let (driver, inbox) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(SyncPhase::new());
        let backoff = config.backoff();

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                monitor,
                schema,
                queue,
                locks,
                offline,
                realtime,
                router,
                events,
                driver,
                phase,
                backoff,
            }),
            inbox: Mutex::new(Some(inbox)),
            tasks: Mutex::new(Vec::new()),
            halted: Arc::new(RwLock::new(None)),
        })
    }

    /// Start probing connectivity, the realtime channel and the driver.
    pub fn start(&self) -> Result<(), EngineError> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(drive(
            self.inner.clone(),
            inbox,
            self.halted.clone(),
        )));
        tasks.push(tokio::spawn(forward_expired_locks(self.inner.clone())));
        tasks.push(tokio::spawn(forward_realtime_events(self.inner.clone())));

        self.inner.monitor.start_monitoring(None);
        self.inner.realtime.start();
        info!(
            tenant = %self.inner.config.tenant_id,
            device = %self.inner.config.device_id,
            "sync engine started"
        );
        Ok(())
    }

    /// Record a local change. It is applied to the local cache immediately
    /// and sent when the device is online and the schema is reconciled.
    pub async fn enqueue_mutation(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: OperationType,
        payload: Vec<u8>,
    ) -> Result<SyncQueueEntry, EngineError> {
        self.ensure_running()?;
        match self
            .inner
            .queue
            .enqueue(operation, EntityKey::new(entity_type, entity_id), payload)
            .await
        {
            Ok(entry) => {
                self.inner.notify(Event::MutationEnqueued);
                Ok(entry)
            }
            Err(e) => {
                if e.kind() == ErrorKind::Fatal {
                    self.inner.notify(Event::Fatal {
                        reason: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Decide what happens to a quarantined mutation.
    pub async fn resolve_mutation(
        &self,
        id: &MutationId,
        resolution: Resolution,
    ) -> Result<Resolved, EngineError> {
        self.ensure_running()?;
        let resolved = self.inner.queue.resolve(id, resolution).await?;
        self.inner.notify(Event::MutationEnqueued);
        Ok(resolved)
    }

    /// Lock a record for editing.
    ///
    /// Online this is an exclusive remote lease. Otherwise an advisory offline
    /// lock is recorded and reconciled on the next reconnect.
    pub async fn acquire_lock(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<LockHandle, EngineError> {
        self.ensure_running()?;
        let entity = EntityKey::new(entity_type, entity_id);

        if self.inner.monitor.current().is_online() {
            match self.inner.locks.acquire(&entity).await {
                Ok(lock) => return Ok(LockHandle::Remote(lock)),
                Err(LockError::NotOnline) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let lock = self
            .inner
            .offline
            .acquire_offline(&entity, &self.inner.config.user_id)
            .await?;
        debug!(%entity, "offline lock taken");
        Ok(LockHandle::Offline(lock))
    }

    /// Give a lock back.
    pub async fn release_lock(&self, lock: &LockHandle) -> Result<(), EngineError> {
        match lock {
            LockHandle::Remote(lock) => self.inner.locks.release(&lock.id).await?,
            LockHandle::Offline(lock) => {
                self.inner.offline.release_offline(&lock.entity).await?;
            }
        }
        Ok(())
    }

    /// Deliver remote changes of `entity_type` to `sink`.
    pub fn subscribe(&self, entity_type: &str, sink: Arc<dyn ChangeSink>) {
        self.inner.router.subscribe(entity_type, sink);
    }

    /// Current connectivity.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.monitor.current()
    }

    /// Where the reconnect sequence is.
    pub fn phase(&self) -> SyncPhase {
        self.inner.phase.borrow().clone()
    }

    /// Observe phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Engine notices.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// The durable outbox.
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// Remote leases held by this device.
    pub fn record_locks(&self) -> &RecordLockManager {
        &self.inner.locks
    }

    /// Advisory locks taken offline.
    pub fn offline_locks(&self) -> &OfflineLockManager {
        &self.inner.offline
    }

    /// Schema state.
    pub fn schema(&self) -> &SchemaSyncService {
        &self.inner.schema
    }

    /// Realtime merge state.
    pub fn realtime(&self) -> &RealtimeSyncHandler {
        &self.inner.realtime
    }

    /// Stop every background task and give held leases back.
    ///
    /// Queued mutations and offline locks stay in the local store.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner.monitor.stop();
        self.inner.realtime.stop().await;

        for lock in self.inner.locks.held_locks() {
            if let Err(e) = self.inner.locks.release(&lock.id).await {
                debug!(lock_id = %lock.id, error = %e, "release on shutdown failed");
            }
        }
        info!("sync engine stopped");
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match &*self.halted.read().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => Err(EngineError::Halted(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.inner.monitor.stop();
        self.inner.realtime.abort();
    }
}

impl EngineInner {
    fn notify(&self, event: Event) {
        // Fails only once the driver is gone.
        let _ = self.driver.send(DriverMsg::Event(event));
    }

    fn report(&self, epoch: u64, event: Event) {
        let _ = self.driver.send(DriverMsg::Result { epoch, event });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// The single owner of the lifecycle phase.
async fn drive(
    inner: Arc<EngineInner>,
    mut inbox: mpsc::UnboundedReceiver<DriverMsg>,
    halted: Arc<RwLock<Option<String>>>,
) {
    let mut phase = SyncPhase::new();
    let mut epoch: u64 = 0;
    let mut connectivity = inner.monitor.subscribe();
    let mut last = ConnectionState::Offline;

    loop {
        let event = tokio::select! {
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                let event = connectivity_event(last, state, &phase);
                last = state;
                match event {
                    Some(event) => {
                        if event == Event::WentOnline {
                            inner.realtime.reconnect_now();
                        }
                        epoch += 1;
                        event
                    }
                    None => continue,
                }
            }
            msg = inbox.recv() => match msg {
                Some(DriverMsg::Event(event)) => event,
                Some(DriverMsg::Result { epoch: from, event }) if from == epoch => event,
                Some(DriverMsg::Result { event, .. }) => {
                    debug!(?event, "dropping result of an earlier connection");
                    continue;
                }
                None => break,
            },
        };

        let aborted = event == Event::DrainAborted;
        let (next, actions) = phase.clone().on_event(event);
        if next != phase {
            debug!(from = ?phase, to = ?next, "sync phase changed");
        }
        phase = next;
        inner.phase.send_replace(phase.clone());

        if aborted && inner.monitor.current().is_online() {
            // The remote went away without the probe noticing; retry the
            // whole sequence.
            let delay = inner.backoff.delay(1);
            let retry = inner.clone();
            let at = epoch;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                retry.report(at, Event::WentOnline);
            });
        }

        if let SyncPhase::Halted { reason } = &phase {
            error!(%reason, "sync engine halted");
            *halted.write().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
            for action in actions {
                execute(&inner, epoch, action);
            }
            inner.monitor.stop();
            inner.realtime.stop().await;
            break;
        }

        for action in actions {
            execute(&inner, epoch, action);
        }
    }
}

/// Lifecycle event for a connectivity change, if it starts a new connection.
///
/// A `Reconnecting` blip that recovers while the sequence is still running
/// belongs to the same connection; only a disconnected phase starts over.
fn connectivity_event(
    last: ConnectionState,
    state: ConnectionState,
    phase: &SyncPhase,
) -> Option<Event> {
    match state {
        ConnectionState::Online
            if last != ConnectionState::Online && *phase == SyncPhase::Disconnected =>
        {
            Some(Event::WentOnline)
        }
        ConnectionState::Offline if last != ConnectionState::Offline => Some(Event::WentOffline),
        _ => None,
    }
}

fn execute(inner: &Arc<EngineInner>, epoch: u64, action: Action) {
    match action {
        Action::CheckSchema => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let event = match inner.schema.reconcile().await {
                    Ok(version) => {
                        debug!(version = version.local, "schema reconciled");
                        Event::SchemaReady
                    }
                    Err(e) if e.kind() == ErrorKind::Transient => {
                        warn!(error = %e, "schema check failed");
                        Event::SchemaFailed {
                            error: e.to_string(),
                        }
                    }
                    Err(e) => Event::Fatal {
                        reason: e.to_string(),
                    },
                };
                inner.report(epoch, event);
            });
        }
        Action::ScheduleSchemaRetry { attempt } => {
            let delay = inner.backoff.delay(attempt);
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.report(epoch, Event::SchemaRetryTimer);
            });
        }
        Action::CloseSchemaGate => inner.schema.close_gate(),
        Action::DrainQueue => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let event = match inner.queue.drain().await {
                    Ok(report) => {
                        if !report.failed.is_empty() {
                            inner.emit(EngineEvent::DrainFailures(report.failed.clone()));
                        }
                        if report.aborted {
                            Event::DrainAborted
                        } else {
                            Event::DrainFinished {
                                retry_in: report.next_retry_in,
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Fatal => Event::Fatal {
                        reason: e.to_string(),
                    },
                    Err(e) => {
                        debug!(error = %e, "drain refused");
                        Event::DrainAborted
                    }
                };
                inner.report(epoch, event);
            });
        }
        Action::ScheduleDrain { delay } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.report(epoch, Event::DrainTimer);
            });
        }
        Action::ReconcileLocks => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let event = match inner.offline.reconcile_on_reconnect(&inner.locks).await {
                    Ok(report) => {
                        for discarded in report.discarded {
                            inner.emit(EngineEvent::OfflineLockDiscarded(discarded));
                        }
                        Event::LocksReconciled
                    }
                    Err(e) if e.kind() == ErrorKind::Fatal => Event::Fatal {
                        reason: e.to_string(),
                    },
                    Err(e) => {
                        warn!(error = %e, "offline lock reconciliation failed");
                        Event::LocksReconciled
                    }
                };
                inner.report(epoch, event);
            });
        }
        Action::ExpireHeldLocks => {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.locks.expire_all().await {
                    if e.kind() == ErrorKind::Fatal {
                        inner.notify(Event::Fatal {
                            reason: e.to_string(),
                        });
                    }
                }
            });
        }
        Action::ResyncChanges => {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.realtime.resync().await {
                    if e.kind() == ErrorKind::Fatal {
                        inner.notify(Event::Fatal {
                            reason: e.to_string(),
                        });
                    } else {
                        warn!(error = %e, "resync after reconnect failed");
                    }
                }
            });
        }
        Action::Emit(notice) => inner.emit(match notice {
            Notice::Online => EngineEvent::Online,
            Notice::Offline => EngineEvent::Offline,
            Notice::Synced => EngineEvent::Synced,
            Notice::SchemaCheckFailed { attempt, error } => {
                EngineEvent::SchemaCheckFailed { attempt, error }
            }
            Notice::Halted { reason } => EngineEvent::Halted { reason },
        }),
    }
}

async fn forward_expired_locks(inner: Arc<EngineInner>) {
    let mut expired = inner.locks.subscribe_expired();
    loop {
        match expired.recv().await {
            Ok(lock) => inner.emit(EngineEvent::LockExpired(lock)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "lock expiry notices dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn forward_realtime_events(inner: Arc<EngineInner>) {
    let mut events = inner.realtime.subscribe_events();
    loop {
        match events.recv().await {
            Ok(RealtimeEvent::Fatal { reason }) => inner.notify(Event::Fatal { reason }),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::remote::MemoryRemote;
    use crate::store::{keys, MemoryStore, StoreOp};
    use std::time::Duration;
    use sync_types::{DeviceId, TenantId, UserId};

    fn config(user: &str) -> SyncConfig {
        SyncConfig::new(TenantId::new("acme"), UserId::new(user), DeviceId::new())
            .with_probe_intervals(Duration::from_millis(20), Duration::from_millis(20))
            .with_failures_before_offline(1)
            .with_request_timeout(Duration::from_millis(500))
            .with_retry(3, Duration::from_millis(10), Duration::from_millis(50))
            .with_retry_jitter(Duration::ZERO)
            .with_lease_ttl(Duration::from_secs(3))
    }

    async fn engine(config: SyncConfig, store: &MemoryStore, remote: &MemoryRemote) -> SyncEngine {
        SyncEngine::open(
            config,
            Arc::new(store.clone()),
            Arc::new(remote.clone()),
            Arc::new(MemoryChannel::new(remote.clone())),
            vec![],
        )
        .await
        .unwrap()
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        wanted: fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let engine = engine(config("alice"), &MemoryStore::new(), &MemoryRemote::new()).await;
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_sequence_drains_queue_and_reports_synced() {
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &MemoryStore::new(), &remote).await;
        engine
            .enqueue_mutation("invoice", "R2", OperationType::Create, b"{}".to_vec())
            .await
            .unwrap();
        let mut events = engine.events();

        engine.start().unwrap();
        wait_for(&mut events, |e| *e == EngineEvent::Online).await;
        wait_for(&mut events, |e| *e == EngineEvent::Synced).await;

        assert!(engine.queue().is_empty().await);
        assert_eq!(remote.applied_count(), 1);
        assert!(engine.phase().is_steady());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn offline_acquire_falls_back_to_advisory_lock() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);
        let engine = engine(config("alice"), &MemoryStore::new(), &remote).await;
        engine.start().unwrap();

        let lock = engine.acquire_lock("invoice", "R1").await.unwrap();
        assert!(!lock.is_remote());
        assert!(engine
            .offline_locks()
            .get(&EntityKey::new("invoice", "R1"))
            .await
            .is_some());

        engine.release_lock(&lock).await.unwrap();
        assert!(engine.offline_locks().live().await.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn online_acquire_takes_remote_lease() {
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &MemoryStore::new(), &remote).await;
        let mut events = engine.events();
        engine.start().unwrap();
        wait_for(&mut events, |e| *e == EngineEvent::Online).await;

        let lock = engine.acquire_lock("invoice", "R1").await.unwrap();
        assert!(lock.is_remote());
        assert!(remote
            .live_lock(&TenantId::new("acme"), &EntityKey::new("invoice", "R1"))
            .is_some());

        engine.shutdown().await;
        assert!(remote
            .live_lock(&TenantId::new("acme"), &EntityKey::new("invoice", "R1"))
            .is_none());
    }

    #[tokio::test]
    async fn going_offline_expires_held_locks() {
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &MemoryStore::new(), &remote).await;
        let mut events = engine.events();
        engine.start().unwrap();
        wait_for(&mut events, |e| *e == EngineEvent::Synced).await;
        let lock = engine.acquire_lock("invoice", "R1").await.unwrap();

        remote.set_reachable(false);
        wait_for(&mut events, |e| *e == EngineEvent::Offline).await;
        let expired = wait_for(&mut events, |e| matches!(e, EngineEvent::LockExpired(_))).await;

        let LockHandle::Remote(lock) = lock else {
            panic!("expected a remote lease");
        };
        assert!(matches!(expired, EngineEvent::LockExpired(l) if l.id == lock.id));
        assert!(engine.record_locks().held_locks().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_store_syncs_without_registered_migrations() {
        let store = MemoryStore::new();
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &store, &remote).await;
        let mut events = engine.events();

        engine.start().unwrap();
        wait_for(&mut events, |e| *e == EngineEvent::Synced).await;

        assert!(engine.schema().is_ready());
        assert_eq!(engine.schema().local_version().await.unwrap(), 1);
        engine.shutdown().await;
    }

    #[test]
    fn reconnecting_blip_keeps_the_running_connection() {
        let draining = SyncPhase::Draining {
            after_reconnect: true,
            rerun: false,
        };
        assert_eq!(
            connectivity_event(ConnectionState::Reconnecting, ConnectionState::Online, &draining),
            None
        );
        assert_eq!(
            connectivity_event(
                ConnectionState::Reconnecting,
                ConnectionState::Online,
                &SyncPhase::Disconnected
            ),
            Some(Event::WentOnline)
        );
        assert_eq!(
            connectivity_event(ConnectionState::Offline, ConnectionState::Online, &SyncPhase::Disconnected),
            Some(Event::WentOnline)
        );
        assert_eq!(
            connectivity_event(ConnectionState::Reconnecting, ConnectionState::Offline, &draining),
            Some(Event::WentOffline)
        );
        assert_eq!(
            connectivity_event(ConnectionState::Online, ConnectionState::Reconnecting, &draining),
            None
        );
    }

    #[tokio::test]
    async fn reconnecting_blip_during_drain_still_reaches_synced() {
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &MemoryStore::new(), &remote).await;
        engine
            .enqueue_mutation("invoice", "R2", OperationType::Create, b"{}".to_vec())
            .await
            .unwrap();
        let mut events = engine.events();

        engine.start().unwrap();
        wait_for(&mut events, |e| *e == EngineEvent::Online).await;
        // Keep the schema check and drain in flight across the blip.
        remote.set_latency(Duration::from_millis(150));
        engine.inner.monitor.publish(ConnectionState::Reconnecting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.inner.monitor.publish(ConnectionState::Online);

        wait_for(&mut events, |e| *e == EngineEvent::Synced).await;
        assert!(engine.queue().is_empty().await);
        assert_eq!(remote.applied_count(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn local_schema_ahead_halts_engine() {
        let store = MemoryStore::new();
        store
            .run_in_transaction(vec![StoreOp::put(keys::SCHEMA_VERSION, &9u32).unwrap()])
            .await
            .unwrap();
        let remote = MemoryRemote::new();
        let engine = engine(config("alice"), &store, &remote).await;
        engine
            .enqueue_mutation("invoice", "R2", OperationType::Create, vec![])
            .await
            .unwrap();
        let mut events = engine.events();
        engine.start().unwrap();

        wait_for(&mut events, |e| matches!(e, EngineEvent::Halted { .. })).await;

        assert_eq!(remote.applied_count(), 0);
        assert!(engine.phase().is_halted());
        let err = engine
            .enqueue_mutation("invoice", "R3", OperationType::Create, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
