//! Relay server state and the HTTP serve loop.

use crate::config::Config;
use crate::error::RelayError;
use crate::http::build_router;
use crate::storage::SyncStorage;
use std::sync::Arc;
use std::time::Instant;
use sync_types::TenantId;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Shared state behind every HTTP handler.
pub struct SyncRelay {
    config: Config,
    storage: Arc<dyn SyncStorage>,
    started_at: Instant,
    /// Tenants whose change log just grew; wakes realtime sessions.
    appended: broadcast::Sender<TenantId>,
}

impl std::fmt::Debug for SyncRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncRelay {
    /// Create a new SyncRelay with the given config and storage.
    pub fn new(config: Config, storage: Arc<dyn SyncStorage>) -> Self {
        let (appended, _) = broadcast::channel(1024);
        Self {
            config,
            storage,
            started_at: Instant::now(),
            appended,
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &dyn SyncStorage {
        self.storage.as_ref()
    }

    /// Seconds since the relay was created.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Lease length actually granted for a requested TTL.
    pub fn clamp_ttl(&self, requested_ms: u64) -> u64 {
        requested_ms.min(self.config.locks.max_ttl_ms)
    }

    /// Wake realtime sessions subscribed to `tenant_id`.
    pub fn notify_appended(&self, tenant_id: &TenantId) {
        // No receivers just means no open sessions.
        let _ = self.appended.send(tenant_id.clone());
    }

    /// Receive the tenant of every change log append.
    pub fn subscribe_appended(&self) -> broadcast::Receiver<TenantId> {
        self.appended.subscribe()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn serve(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        tracing::info!(addr = %listener.local_addr()?, "relay listening");
        axum::serve(listener, build_router(self)).await?;
        Ok(())
    }
}
