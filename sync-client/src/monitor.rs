//! Connection monitor.
//!
//! Probes the remote store's health endpoint and publishes the resulting
//! [`ConnectionState`] through a `watch` channel. Transition detection is
//! delegated to [`ConnectivityTracker`] (sync-core), so each transition is
//! reported exactly once no matter how many probes observe it.

use crate::config::SyncConfig;
use crate::remote::RemoteStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sync_core::{ConnectionState, ConnectivityTracker, ProbeOutcome, Transition};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Callbacks fired on connectivity transitions. All methods default to no-ops.
pub trait ConnectionHandler: Send + Sync {
    /// Entered `Online`.
    fn on_online(&self) {}

    /// Entered `Offline`.
    fn on_offline(&self) {}

    /// Any transition, including into and out of `Reconnecting`.
    fn on_status_change(&self, _transition: Transition) {}
}

/// Watches connectivity to the remote store.
pub struct ConnectionMonitor {
    remote: Arc<dyn RemoteStore>,
    tracker: Mutex<ConnectivityTracker>,
    state: watch::Sender<ConnectionState>,
    handlers: RwLock<Vec<Arc<dyn ConnectionHandler>>>,
    probe_interval: Duration,
    offline_retry_interval: Duration,
    probe_timeout: Duration,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// Create a monitor. The initial state is `Offline` until a probe succeeds.
    pub fn new(remote: Arc<dyn RemoteStore>, config: &SyncConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Offline);
        Arc::new(Self {
            remote,
            tracker: Mutex::new(ConnectivityTracker::new(config.failures_before_offline)),
            state,
            handlers: RwLock::new(Vec::new()),
            probe_interval: config.probe_interval(),
            offline_retry_interval: config.offline_retry_interval(),
            probe_timeout: config.probe_timeout(),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Last known state, without I/O.
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register a handler without starting the probe loop.
    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handler);
    }

    /// Probe once and return the resulting state.
    ///
    /// Concurrent calls are serialized so a transition is never reported twice.
    pub async fn check_status(&self) -> ConnectionState {
        let mut tracker = self.tracker.lock().await;
        let outcome = match tokio::time::timeout(self.probe_timeout, self.remote.health()).await {
            Ok(Ok(_)) => ProbeOutcome::Reachable,
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!("health probe timed out");
                ProbeOutcome::Unreachable
            }
        };

        if let Some(transition) = tracker.observe(outcome) {
            info!(from = ?transition.from, to = ?transition.to, "connection state changed");
            self.state.send_replace(transition.to);
            self.notify(transition);
        }
        tracker.state()
    }

    /// Register `handler` and start probing in the background.
    ///
    /// Probes every `probe_interval` while Online and every
    /// `offline_retry_interval` otherwise. Calling it again only adds the
    /// handler.
    pub fn start_monitoring(self: &Arc<Self>, handler: Option<Arc<dyn ConnectionHandler>>) {
        if let Some(handler) = handler {
            self.add_handler(handler);
        }

        let mut task = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            // Exits once the monitor is dropped.
            while let Some(monitor) = weak.upgrade() {
                let state = monitor.check_status().await;
                let delay = if state.is_online() {
                    monitor.probe_interval
                } else {
                    monitor.offline_retry_interval
                };
                drop(monitor);
                tokio::time::sleep(delay).await;
            }
        }));
    }

    /// Stop the probe loop.
    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn publish(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn notify(&self, transition: Transition) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.on_status_change(transition);
            if transition.went_online() {
                handler.on_online();
            } else if transition.went_offline() {
                handler.on_offline();
            }
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter {
        online: AtomicU32,
        offline: AtomicU32,
        changes: AtomicU32,
    }

    impl ConnectionHandler for Counter {
        fn on_online(&self) {
            self.online.fetch_add(1, Ordering::SeqCst);
        }

        fn on_offline(&self) {
            self.offline.fetch_add(1, Ordering::SeqCst);
        }

        fn on_status_change(&self, _transition: Transition) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_failures_before_offline(2)
            .with_probe_intervals(Duration::from_millis(10), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn first_probe_goes_online() {
        let remote = MemoryRemote::new();
        let monitor = ConnectionMonitor::new(Arc::new(remote), &config());
        assert_eq!(monitor.current(), ConnectionState::Offline);

        assert_eq!(monitor.check_status().await, ConnectionState::Online);
        assert_eq!(monitor.current(), ConnectionState::Online);
    }

    #[tokio::test]
    async fn callbacks_fire_once_per_transition() {
        let remote = MemoryRemote::new();
        let monitor = ConnectionMonitor::new(Arc::new(remote.clone()), &config());
        let counter = Arc::new(Counter::default());
        monitor.add_handler(counter.clone());

        monitor.check_status().await;
        monitor.check_status().await;
        monitor.check_status().await;
        assert_eq!(counter.online.load(Ordering::SeqCst), 1);

        remote.set_reachable(false);
        assert_eq!(monitor.check_status().await, ConnectionState::Reconnecting);
        assert_eq!(monitor.check_status().await, ConnectionState::Offline);
        monitor.check_status().await;

        assert_eq!(counter.offline.load(Ordering::SeqCst), 1);
        // Offline → Online → Reconnecting → Offline
        assert_eq!(counter.changes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let remote = MemoryRemote::new();
        remote.set_latency(Duration::from_millis(200));
        let mut config = config();
        config.probe_timeout_ms = 20;
        let monitor = ConnectionMonitor::new(Arc::new(remote), &config);

        assert_eq!(monitor.check_status().await, ConnectionState::Offline);
    }

    #[tokio::test]
    async fn background_loop_publishes_state() {
        let remote = MemoryRemote::new();
        let monitor = ConnectionMonitor::new(Arc::new(remote.clone()), &config());
        let mut rx = monitor.subscribe();
        monitor.start_monitoring(None);

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.is_online()))
            .await
            .unwrap()
            .unwrap();

        remote.set_reachable(false);
        tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| *s == ConnectionState::Offline),
        )
        .await
        .unwrap()
        .unwrap();

        monitor.stop();
    }
}
