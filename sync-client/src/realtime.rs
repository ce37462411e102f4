//! Realtime sync handler.
//!
//! Keeps the realtime channel open, merges inbound change notifications into
//! the local cache and dispatches them to subscribers. Echoes of this
//! device's own writes and notifications not newer than the cached copy are
//! dropped.
//!
//! The last contiguous change sequence is persisted. After every (re)connect,
//! and whenever the live channel skips a sequence, the handler pulls the
//! missing changes with `changes_since` and merges them through the same rules.

use crate::config::SyncConfig;
use crate::channel::RealtimeChannel;
use crate::error::{ChannelError, RealtimeError, StoreError};
use crate::remote::{with_timeout, RemoteStore};
use crate::store::{keys, load, LocalStore, StoreOp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use sync_core::{decide, normalize, Backoff, MergeDecision, SequenceTracker};
use sync_types::{
    now_millis, CachedRecord, ChangeNotification, ChannelMessage, DeviceId, Sequence, Subscribe,
    TenantId, UserId,
};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives applied remote changes.
pub trait ChangeSink: Send + Sync {
    /// A remote change was merged into the local cache.
    fn on_change(&self, record: &CachedRecord, change: &ChangeNotification);
}

/// Routes applied changes to the sinks subscribed to their entity type.
#[derive(Default)]
pub struct ChangeRouter {
    routes: RwLock<HashMap<String, Vec<Arc<dyn ChangeSink>>>>,
}

impl ChangeRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver changes of `entity_type` to `sink`.
    pub fn subscribe(&self, entity_type: impl Into<String>, sink: Arc<dyn ChangeSink>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity_type.into())
            .or_default()
            .push(sink);
    }
}

impl ChangeSink for ChangeRouter {
    fn on_change(&self, record: &CachedRecord, change: &ChangeNotification) {
        let sinks = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record.entity.entity_type)
            .cloned()
            .unwrap_or_default();
        for sink in sinks {
            sink.on_change(record, change);
        }
    }
}

/// Connection-level happenings, for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Handshake completed.
    Connected {
        /// Highest change sequence of the tenant.
        max_sequence: Sequence,
    },
    /// The channel dropped; reconnecting with backoff.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// A resync pass finished.
    Resynced {
        /// Changes applied by the pass.
        applied: usize,
    },
    /// The local store failed while merging; the handler stopped.
    Fatal {
        /// Why.
        reason: String,
    },
}

/// Counters of merge decisions since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Changes applied and dispatched.
    pub applied: u64,
    /// Own writes echoed back.
    pub echoes: u64,
    /// Changes not newer than the cached copy.
    pub stale: u64,
}

/// Merges the remote change feed into the local cache.
pub struct RealtimeSyncHandler {
    tenant_id: TenantId,
    device_id: DeviceId,
    user_id: RwLock<UserId>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    channel: Arc<dyn RealtimeChannel>,
    sink: RwLock<Option<Arc<dyn ChangeSink>>>,
    tracker: Mutex<SequenceTracker>,
    resyncing: Mutex<()>,
    events: broadcast::Sender<RealtimeEvent>,
    wake: Notify,
    backoff: Backoff,
    heartbeat_interval: Duration,
    request_timeout: Duration,
    page_size: u32,
    applied: AtomicU64,
    echoes: AtomicU64,
    stale: AtomicU64,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeSyncHandler {
    /// Create a handler. `sink` receives applied changes (see also
    /// [`set_dispatch`](Self::set_dispatch)).
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        channel: Arc<dyn RealtimeChannel>,
        sink: Option<Arc<dyn ChangeSink>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            tenant_id: config.tenant_id.clone(),
            device_id: config.device_id,
            user_id: RwLock::new(config.user_id.clone()),
            store,
            remote,
            channel,
            sink: RwLock::new(sink),
            tracker: Mutex::new(SequenceTracker::new()),
            resyncing: Mutex::new(()),
            events,
            wake: Notify::new(),
            backoff: config.backoff(),
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            page_size: config.resync_page_size.max(1),
            applied: AtomicU64::new(0),
            echoes: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            task: std::sync::Mutex::new(None),
        })
    }

    /// User announced in the subscribe handshake.
    pub fn set_current_user_id(&self, user_id: UserId) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    /// Replace the sink receiving applied changes.
    pub fn set_dispatch(&self, sink: Arc<dyn ChangeSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Connection-level events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    /// Merge decision counters.
    pub fn stats(&self) -> MergeStats {
        MergeStats {
            applied: self.applied.load(Ordering::Relaxed),
            echoes: self.echoes.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }

    /// Every change up to this sequence has been merged.
    pub async fn last_sequence(&self) -> Sequence {
        self.tracker.lock().await.contiguous()
    }

    /// Connect and subscribe to the tenant's change feed.
    ///
    /// Returns the tenant's highest change sequence as reported by the remote.
    pub async fn initialize(&self) -> Result<Sequence, RealtimeError> {
        let persisted: Option<Sequence> =
            load(self.store.as_ref(), &keys::change_sequence(&self.tenant_id)).await?;
        let last_sequence = {
            let mut tracker = self.tracker.lock().await;
            if let Some(persisted) = persisted.filter(|p| *p > tracker.contiguous()) {
                *tracker = SequenceTracker::with_sequence(persisted);
            }
            tracker.contiguous()
        };

        self.channel.connect().await?;
        let subscribe = ChannelMessage::Subscribe(Subscribe {
            tenant_id: self.tenant_id.clone(),
            user_id: self
                .user_id
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            device_id: self.device_id,
            last_sequence,
        });
        self.channel.send(&subscribe.to_bytes()?).await?;

        let handshake = tokio::time::timeout(self.request_timeout, async {
            loop {
                let frame = self.channel.recv().await?;
                match ChannelMessage::from_bytes(&frame)? {
                    ChannelMessage::Subscribed { max_sequence } => return Ok(max_sequence),
                    ChannelMessage::Pong => {}
                    other => {
                        return Err(ChannelError::Protocol(format!(
                            "expected subscribed, got {other:?}"
                        )))
                    }
                }
            }
        })
        .await
        .map_err(|_| ChannelError::Timeout)?;
        let max_sequence = handshake?;

        info!(tenant = %self.tenant_id, %last_sequence, %max_sequence, "realtime channel subscribed");
        let _ = self.events.send(RealtimeEvent::Connected { max_sequence });
        Ok(max_sequence)
    }

    /// Merge one notification into the local cache.
    pub async fn apply_change(
        &self,
        change: &ChangeNotification,
    ) -> Result<MergeDecision, StoreError> {
        if change.tenant_id != self.tenant_id {
            debug!(tenant = %change.tenant_id, "ignoring change of another tenant");
            return Ok(MergeDecision::Stale);
        }

        let mut tracker = self.tracker.lock().await;
        let before = tracker.contiguous();
        tracker.received(change.sequence);
        let after = tracker.contiguous();

        let record_key = keys::record(&self.tenant_id, &change.entity);
        let cached: Option<CachedRecord> = load(self.store.as_ref(), &record_key).await?;
        let decision = decide(change, &self.device_id, cached.and_then(|r| r.version));

        let mut ops = Vec::new();
        let applied = match decision {
            MergeDecision::Apply => {
                let record = normalize(change, now_millis());
                ops.push(StoreOp::put(record_key, &record)?);
                Some(record)
            }
            MergeDecision::Echo | MergeDecision::Stale => None,
        };
        if after != before {
            ops.push(StoreOp::put(keys::change_sequence(&self.tenant_id), &after)?);
        }
        if !ops.is_empty() {
            self.store.run_in_transaction(ops).await?;
        }
        drop(tracker);

        match (decision, applied) {
            (MergeDecision::Apply, Some(record)) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(entity = %change.entity, version = %change.version, "remote change applied");
                let sink = self
                    .sink
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(sink) = sink {
                    sink.on_change(&record, change);
                }
            }
            (MergeDecision::Echo, _) => {
                self.echoes.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                debug!(entity = %change.entity, version = %change.version, "stale change dropped");
            }
        }
        Ok(decision)
    }

    /// Pull and merge every change after the last contiguous sequence.
    ///
    /// Returns the number of changes applied.
    pub async fn resync(&self) -> Result<usize, RealtimeError> {
        let _resyncing = self.resyncing.lock().await;
        let mut applied = 0;

        loop {
            let after = self.tracker.lock().await.contiguous();
            let page = with_timeout(
                self.request_timeout,
                self.remote
                    .changes_since(&self.tenant_id, after, self.page_size),
            )
            .await?;

            for change in &page.changes {
                if self.apply_change(change).await? == MergeDecision::Apply {
                    applied += 1;
                }
            }

            if !page.has_more {
                let mut tracker = self.tracker.lock().await;
                let before = tracker.contiguous();
                tracker.acknowledge_up_to(page.max_sequence);
                let after = tracker.contiguous();
                if after != before {
                    self.store
                        .run_in_transaction(vec![StoreOp::put(
                            keys::change_sequence(&self.tenant_id),
                            &after,
                        )?])
                        .await?;
                }
                break;
            }
            if page.changes.is_empty() {
                // A page claiming more but carrying nothing would loop forever.
                break;
            }
        }

        if applied > 0 {
            info!(applied, "resync merged remote changes");
        }
        let _ = self.events.send(RealtimeEvent::Resynced { applied });
        Ok(applied)
    }

    /// Run the channel in the background: connect with backoff, resync after
    /// each connect, merge live changes and send heartbeats.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let handler = self.clone();
        *task = Some(tokio::spawn(async move { handler.run().await }));
    }

    /// Skip the current reconnect backoff (connectivity came back).
    pub fn reconnect_now(&self) {
        self.wake.notify_one();
    }

    /// Abort the background task without closing the channel.
    pub fn abort(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Stop the background task and close the channel.
    pub async fn stop(&self) {
        self.abort();
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "closing realtime channel failed");
        }
    }

    async fn run(&self) {
        let mut attempt: u32 = 0;
        loop {
            if let Err(e) = self.connect_and_resync().await {
                if let RealtimeError::Store(e) = &e {
                    self.halt(e);
                    return;
                }
                attempt = attempt.saturating_add(1);
                let delay = self.backoff.delay(attempt);
                debug!(error = %e, attempt, ?delay, "realtime connect failed");
                let _ = self.channel.close().await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.wake.notified() => {}
                }
                continue;
            }
            attempt = 0;

            match self.pump().await {
                Err(RealtimeError::Store(e)) => {
                    self.halt(&e);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "realtime channel lost");
                    let _ = self.events.send(RealtimeEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    if let Err(e) = self.channel.close().await {
                        debug!(error = %e, "closing realtime channel failed");
                    }
                }
                Ok(()) => {}
            }
        }
    }

    async fn connect_and_resync(&self) -> Result<(), RealtimeError> {
        let max_sequence = self.initialize().await?;
        if max_sequence > self.last_sequence().await {
            self.resync_logged().await?;
        }
        Ok(())
    }

    /// Merge frames until the channel fails.
    async fn pump(&self) -> Result<(), RealtimeError> {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = self.channel.recv() => {
                    let frame = frame?;
                    last_seen = Instant::now();
                    self.handle_frame(&frame).await?;
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.heartbeat_interval * 2 {
                        return Err(ChannelError::Timeout.into());
                    }
                    self.channel.send(&ChannelMessage::Ping.to_bytes()?).await?;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) -> Result<(), RealtimeError> {
        match ChannelMessage::from_bytes(frame).map_err(ChannelError::from)? {
            ChannelMessage::Change(change) => {
                self.apply_change(&change).await?;
                if self.tracker.lock().await.has_gaps() {
                    debug!(sequence = %change.sequence, "sequence gap, resyncing");
                    self.resync_logged().await?;
                }
            }
            ChannelMessage::Ping => {
                self.channel
                    .send(&ChannelMessage::Pong.to_bytes()?)
                    .await?;
            }
            ChannelMessage::Pong | ChannelMessage::Subscribed { .. } => {}
            ChannelMessage::Subscribe(_) => {
                return Err(ChannelError::Protocol("unexpected subscribe from remote".into()).into())
            }
        }
        Ok(())
    }

    /// Resync, treating remote failures as non-fatal: the next gap or
    /// reconnect tries again.
    async fn resync_logged(&self) -> Result<(), RealtimeError> {
        match self.resync().await {
            Ok(_) => Ok(()),
            Err(RealtimeError::Store(e)) => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "resync failed");
                Ok(())
            }
        }
    }

    fn halt(&self, e: &StoreError) {
        error!(error = %e, "local store failed while merging remote changes");
        let _ = self.events.send(RealtimeEvent::Fatal {
            reason: e.to_string(),
        });
    }
}
