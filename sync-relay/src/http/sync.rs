//! Mutation and change feed endpoints.

use crate::error::StorageError;
use crate::server::SyncRelay;
use axum::extract::Query;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use sync_types::{now_millis, ChangesPage, MutationAck, MutationRequest, Sequence, TenantId};

/// Query string of `GET /sync/changes`.
#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    tenant_id: String,
    #[serde(default)]
    after: u64,
    limit: Option<u32>,
}

pub async fn apply_mutation_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<MutationAck>, StorageError> {
    let ack = relay
        .storage()
        .apply_mutation(&request, now_millis())
        .await?;
    tracing::debug!(
        mutation_id = %ack.mutation_id,
        tenant = %request.tenant_id,
        entity = %request.entity,
        version = ack.version.value(),
        sequence = ack.sequence.value(),
        "mutation applied"
    );
    relay.notify_appended(&request.tenant_id);
    Ok(Json(ack))
}

pub async fn changes_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesPage>, StorageError> {
    if query.tenant_id.is_empty() {
        return Err(StorageError::Rejected("tenant_id is required".into()));
    }
    let max = relay.config().sync.max_page_size.max(1);
    let limit = query.limit.unwrap_or(max).clamp(1, max);

    let page = relay
        .storage()
        .changes_since(&TenantId::new(query.tenant_id), Sequence::new(query.after), limit)
        .await?;
    Ok(Json(page))
}
