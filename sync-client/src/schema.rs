//! Schema sync service.
//!
//! Brings the local cache up to the remote schema version before anything is
//! sent. The result is published as a gate (`watch<bool>`): the sync queue
//! refuses to drain while it is closed.

use crate::error::{SchemaError, StoreError};
use crate::remote::{with_timeout, RemoteStore};
use crate::store::{keys, load, LocalStore, StoreOp};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{plan_migrations, SchemaPlanError};
use sync_types::SchemaVersion;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// An additive change to the local store layout.
///
/// Must be idempotent: a crash between `apply` and recording the new version
/// means it runs again on the next start.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Schema version reached after this migration.
    fn target_version(&self) -> u32;

    /// Apply the migration.
    async fn apply(&self, store: &dyn LocalStore) -> Result<(), StoreError>;
}

/// Reconciles the local schema version with the remote one.
pub struct SchemaSyncService {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    migrations: BTreeMap<u32, Arc<dyn Migration>>,
    gate: watch::Sender<bool>,
    request_timeout: Duration,
    running: Mutex<()>,
}

impl SchemaSyncService {
    /// Create a service with the gate closed.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        migrations: Vec<Arc<dyn Migration>>,
        request_timeout: Duration,
    ) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            store,
            remote,
            migrations: migrations
                .into_iter()
                .map(|m| (m.target_version(), m))
                .collect(),
            gate,
            request_timeout,
            running: Mutex::new(()),
        }
    }

    /// Reconcile once at startup.
    pub async fn initialize(&self) -> Result<SchemaVersion, SchemaError> {
        self.reconcile().await
    }

    /// Fetch the remote version, migrate the local store up to it and open
    /// the gate. The gate stays closed on any error.
    pub async fn reconcile(&self) -> Result<SchemaVersion, SchemaError> {
        let _running = self.running.lock().await;

        let remote = with_timeout(self.request_timeout, self.remote.schema_version()).await?;
        let local = self.local_version().await?;
        let version = SchemaVersion { local, remote };

        let available: Vec<u32> = self.migrations.keys().copied().collect();
        let plan = plan_migrations(version, &available).map_err(|e| match e {
            SchemaPlanError::LocalAhead { local, remote } => {
                SchemaError::LocalAhead { local, remote }
            }
            SchemaPlanError::Missing(v) => SchemaError::MissingMigration(v),
        });
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                warn!(local, remote, error = %e, "local schema is incompatible");
                self.close_gate();
                return Err(e);
            }
        };

        let mut recorded = local;
        for target in plan {
            // Planned steps are always registered.
            let Some(migration) = self.migrations.get(&target) else {
                return Err(SchemaError::MissingMigration(target));
            };
            info!(from = target - 1, to = target, "applying local migration");
            migration
                .apply(self.store.as_ref())
                .await
                .map_err(|e| SchemaError::MigrationFailed {
                    version: target,
                    reason: e.to_string(),
                })?;
            self.store
                .run_in_transaction(vec![StoreOp::put(keys::SCHEMA_VERSION, &target)?])
                .await?;
            recorded = target;
        }
        if recorded < remote {
            // Only the baseline was skipped.
            self.store
                .run_in_transaction(vec![StoreOp::put(keys::SCHEMA_VERSION, &remote)?])
                .await?;
        }

        self.gate.send_replace(true);
        Ok(SchemaVersion { local: remote, remote })
    }

    /// Version recorded in the local store (0 for a fresh store).
    pub async fn local_version(&self) -> Result<u32, SchemaError> {
        Ok(load::<u32>(self.store.as_ref(), keys::SCHEMA_VERSION)
            .await?
            .unwrap_or(0))
    }

    /// Whether the last reconcile succeeded and connectivity was not lost since.
    pub fn is_ready(&self) -> bool {
        *self.gate.borrow()
    }

    /// Observe the gate.
    pub fn gate(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    /// Close the gate (connectivity lost; reconcile again on reconnect).
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }
}
