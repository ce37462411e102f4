//! Remote store abstraction.
//!
//! The remote store is the authority for record locks and entity versions.
//! The sync core talks to it through [`RemoteStore`]:
//! - [`HttpRemote`]: the REST API served by sync-relay
//! - [`MemoryRemote`]: an in-process authority for tests, with reachability
//!   toggling and fault injection
//!
//! Callers wrap every call in the configured request timeout; an elapsed
//! timeout becomes [`RemoteError::Timeout`].

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::error::RemoteError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use sync_types::{
    ChangesPage, EntityKey, HealthResponse, LockRequest, MutationAck, MutationRequest,
    RecordLock, Sequence, TenantId,
};

/// Operations consumed from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Health probe.
    async fn health(&self) -> Result<HealthResponse, RemoteError>;

    /// Apply a mutation. Idempotent per `mutation_id`.
    async fn apply_mutation(&self, request: &MutationRequest) -> Result<MutationAck, RemoteError>;

    /// Acquire a lease on a record.
    async fn acquire_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError>;

    /// Extend a lease (`request.lock_id` required).
    async fn renew_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError>;

    /// Drop a lease (`request.lock_id` required).
    async fn release_lock(&self, entity: &EntityKey, request: &LockRequest)
        -> Result<(), RemoteError>;

    /// Current remote schema version.
    async fn schema_version(&self) -> Result<u32, RemoteError>;

    /// Changes of a tenant after a sequence, oldest first.
    async fn changes_since(
        &self,
        tenant_id: &TenantId,
        after: Sequence,
        limit: u32,
    ) -> Result<ChangesPage, RemoteError>;
}

/// Run a remote call with a deadline.
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RemoteError::Timeout)?
}
