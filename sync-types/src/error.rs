//! Error types for offsync wire and record encoding.

use thiserror::Error;

/// Errors that can occur while encoding or decoding offsync records and frames.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Encode any serializable record as MessagePack.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    rmp_serde::to_vec(value).map_err(SyncError::Serialization)
}

/// Decode a MessagePack record.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
}
