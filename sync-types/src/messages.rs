//! Remote store API bodies and realtime channel frames.
//!
//! HTTP bodies are JSON; channel frames are MessagePack ([`ChannelMessage`]).

use serde::{Deserialize, Serialize};

use crate::{
    DeviceId, EntityKey, LockHolder, LockId, MutationId, OperationType, Sequence, SyncError,
    TenantId, Timestamp, UserId, Version,
};

/// Body of `POST /sync/mutations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Idempotency key.
    pub mutation_id: MutationId,
    /// Tenant scope.
    pub tenant_id: TenantId,
    /// Create, update or delete.
    pub operation: OperationType,
    /// Target record.
    pub entity: EntityKey,
    /// Serialized record (opaque).
    pub payload: Vec<u8>,
    /// Version the client based this mutation on (`None` for a create).
    pub base_version: Option<Version>,
    /// Originating user.
    pub user_id: UserId,
    /// Originating device, echoed back in change notifications.
    pub device_id: DeviceId,
}

/// Successful answer to a mutation. Replays of the same id get the same ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAck {
    /// The acknowledged mutation.
    pub mutation_id: MutationId,
    /// Version assigned to the entity by this mutation.
    pub version: Version,
    /// When the remote applied it.
    pub applied_at: Timestamp,
    /// Tenant change sequence assigned to it.
    pub sequence: Sequence,
}

/// `409` answer to a mutation whose base version is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationConflict {
    /// The rejected mutation.
    pub mutation_id: MutationId,
    /// Current remote version (`None` if the record does not exist).
    pub current_version: Option<Version>,
    /// Current remote payload, for the caller's merge decision.
    pub current_payload: Option<Vec<u8>>,
}

/// Body of `POST /locks/{entity_type}/{entity_id}/{acquire|renew|release}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Tenant scope.
    pub tenant_id: TenantId,
    /// Requesting user.
    pub user_id: UserId,
    /// Requesting device.
    pub device_id: DeviceId,
    /// Lease to renew or release (ignored by acquire).
    #[serde(default)]
    pub lock_id: Option<LockId>,
    /// Requested lease length in milliseconds.
    pub ttl_ms: u64,
}

/// `409` answer to a lock acquisition on a held record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    /// Current holder, for display.
    pub holder: LockHolder,
    /// When the current lease runs out unless renewed.
    pub expires_at: Timestamp,
}

/// Body of `GET /schema/version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionResponse {
    /// Current remote schema version.
    pub version: u32,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` when the store can serve requests.
    pub status: String,
    /// Server version string.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Body of `GET /sync/changes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesPage {
    /// Changes with sequence greater than the requested one, ascending.
    pub changes: Vec<ChangeNotification>,
    /// Highest sequence in this tenant at the time of the request.
    pub max_sequence: Sequence,
    /// Whether more changes are available after this page.
    pub has_more: bool,
}

/// Generic error body for non-2xx answers without a dedicated shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub error: String,
}

/// A mutation applied by the remote store, broadcast to every subscribed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Tenant scope.
    pub tenant_id: TenantId,
    /// Changed record.
    pub entity: EntityKey,
    /// What happened to it.
    pub operation: OperationType,
    /// Version after the change.
    pub version: Version,
    /// Tenant change sequence.
    pub sequence: Sequence,
    /// Record after the change (empty for deletes).
    pub payload: Vec<u8>,
    /// User who made the change.
    pub origin_user_id: UserId,
    /// Device that made the change.
    pub origin_device_id: DeviceId,
    /// The mutation that produced the change.
    pub mutation_id: MutationId,
}

/// Subscribe/authenticate handshake sent when the channel opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    /// Tenant whose changes to receive.
    pub tenant_id: TenantId,
    /// Subscribing user.
    pub user_id: UserId,
    /// Subscribing device.
    pub device_id: DeviceId,
    /// Last contiguous sequence this device has merged.
    pub last_sequence: Sequence,
}

/// Frames exchanged on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Client → server handshake.
    Subscribe(Subscribe),
    /// Server → client handshake answer.
    Subscribed {
        /// Highest sequence in the tenant.
        max_sequence: Sequence,
    },
    /// Client → server heartbeat.
    Ping,
    /// Server → client heartbeat answer.
    Pong,
    /// Server → client change notification.
    Change(ChangeNotification),
}

impl ChannelMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}
