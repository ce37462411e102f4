//! HTTP endpoints for offsync-relay.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | liveness and version |
//! | `GET /schema/version` | schema version clients migrate to |
//! | `POST /sync/mutations` | apply one mutation |
//! | `GET /sync/changes` | page through a tenant's change log |
//! | `GET /sync/channel` | websocket change feed |
//! | `POST /locks/:entity_type/:entity_id/{acquire,renew,release}` | leases |

mod channel;
pub mod health;
mod locks;
mod sync;

use crate::error::StorageError;
use crate::server::SyncRelay;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use sync_core::LeaseError;
use sync_types::{ErrorBody, LockConflict, SchemaVersionResponse};

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<SyncRelay>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/schema/version", get(schema_version_handler))
        .route("/sync/mutations", post(sync::apply_mutation_handler))
        .route("/sync/changes", get(sync::changes_handler))
        .route("/sync/channel", get(channel::channel_handler))
        .route(
            "/locks/:entity_type/:entity_id/acquire",
            post(locks::acquire_handler),
        )
        .route(
            "/locks/:entity_type/:entity_id/renew",
            post(locks::renew_handler),
        )
        .route(
            "/locks/:entity_type/:entity_id/release",
            post(locks::release_handler),
        )
        .layer(Extension(relay))
}

async fn schema_version_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
) -> Json<SchemaVersionResponse> {
    Json(SchemaVersionResponse {
        version: relay.config().schema.version,
    })
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        match self {
            StorageError::Conflict(conflict) => (StatusCode::CONFLICT, Json(conflict)).into_response(),
            StorageError::Lease(LeaseError::Held { holder, expires_at }) => (
                StatusCode::CONFLICT,
                Json(LockConflict { holder, expires_at }),
            )
                .into_response(),
            StorageError::Lease(err @ LeaseError::NotFound(_)) => {
                error_body(StatusCode::NOT_FOUND, err.to_string())
            }
            StorageError::Lease(err @ LeaseError::Expired(_)) => {
                error_body(StatusCode::GONE, err.to_string())
            }
            StorageError::Lease(err) => error_body(StatusCode::FORBIDDEN, err.to_string()),
            StorageError::Rejected(reason) => error_body(StatusCode::UNPROCESSABLE_ENTITY, reason),
            err => {
                tracing::error!(error = %err, "storage failure");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
            }
        }
    }
}
