//! Lease endpoints.
//!
//! The path names the record; the body names the holder. Renew and release
//! address the lease by `lock_id`.

use crate::error::StorageError;
use crate::server::SyncRelay;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;
use sync_types::{now_millis, EntityKey, LockHolder, LockId, LockRequest, RecordLock};

fn holder(request: &LockRequest) -> LockHolder {
    LockHolder {
        user_id: request.user_id.clone(),
        device_id: request.device_id,
    }
}

fn required_lock_id(request: &LockRequest) -> Result<LockId, StorageError> {
    request
        .lock_id
        .ok_or_else(|| StorageError::Rejected("lock_id is required".into()))
}

fn ttl(relay: &SyncRelay, request: &LockRequest) -> Result<u64, StorageError> {
    if request.ttl_ms == 0 {
        return Err(StorageError::Rejected("ttl_ms must be positive".into()));
    }
    Ok(relay.clamp_ttl(request.ttl_ms))
}

pub async fn acquire_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Json(request): Json<LockRequest>,
) -> Result<Json<RecordLock>, StorageError> {
    let ttl_ms = ttl(&relay, &request)?;
    let entity = EntityKey::new(entity_type, entity_id);
    let lock = relay
        .storage()
        .acquire_lock(
            &request.tenant_id,
            &entity,
            &holder(&request),
            ttl_ms,
            now_millis(),
        )
        .await?;
    tracing::debug!(lock_id = %lock.id, %entity, holder = %lock.holder_user_id, "lease granted");
    Ok(Json(lock))
}

pub async fn renew_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Json(request): Json<LockRequest>,
) -> Result<Json<RecordLock>, StorageError> {
    let lock_id = required_lock_id(&request)?;
    let ttl_ms = ttl(&relay, &request)?;
    let lock = relay
        .storage()
        .renew_lock(&lock_id, &holder(&request), ttl_ms, now_millis())
        .await?;
    if lock.entity != EntityKey::new(entity_type, entity_id) {
        tracing::warn!(%lock_id, entity = %lock.entity, "renew addressed through another record's path");
    }
    Ok(Json(lock))
}

pub async fn release_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Json(request): Json<LockRequest>,
) -> Result<StatusCode, StorageError> {
    let lock_id = required_lock_id(&request)?;
    let lock = relay
        .storage()
        .release_lock(&lock_id, &holder(&request))
        .await?;
    tracing::debug!(%lock_id, entity = %lock.entity, "lease released");
    if lock.entity != EntityKey::new(entity_type, entity_id) {
        tracing::warn!(%lock_id, entity = %lock.entity, "release addressed through another record's path");
    }
    Ok(StatusCode::NO_CONTENT)
}
