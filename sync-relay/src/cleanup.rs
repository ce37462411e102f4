//! Background cleanup task for expired leases.
//!
//! Expired leases are already ignored by acquire; purging keeps the lock
//! table from growing with abandoned rows.

use crate::config::CleanupConfig;
use crate::storage::SyncStorage;
use std::sync::Arc;
use std::time::Duration;
use sync_types::now_millis;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    storage: Arc<dyn SyncStorage>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match storage.purge_expired_locks(now_millis()).await {
                Ok(0) => tracing::debug!("Cleanup: no expired leases"),
                Ok(deleted) => tracing::info!("Cleanup: purged {} expired leases", deleted),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
        }
    })
}
