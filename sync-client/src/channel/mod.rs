//! Realtime channel abstraction for offsync.
//!
//! The realtime handler keeps one persistent, bidirectional connection to the
//! remote store. Frames are MessagePack-encoded [`ChannelMessage`]s:
//! - outbound: `Subscribe` handshake and `Ping` heartbeats
//! - inbound: `Subscribed`, `Pong` and `Change` notifications
//!
//! # Design
//!
//! The channel trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits frame bytes
//! - `recv()` waits for the next frame
//! - `close()` gracefully terminates
//!
//! Implementations: [`WsChannel`] (websocket to the relay), [`MockChannel`]
//! (scripted frames, fault injection) and [`MemoryChannel`] (attached to a
//! [`MemoryRemote`](crate::remote::MemoryRemote)).
//!
//! [`ChannelMessage`]: sync_types::ChannelMessage

mod memory;
mod mock;
mod ws;

pub use memory::MemoryChannel;
pub use mock::MockChannel;
pub use ws::WsChannel;

use crate::error::ChannelError;
use async_trait::async_trait;

/// Persistent connection to the remote store's change feed.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Send one frame.
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;

    /// Wait for the next frame.
    ///
    /// Returns [`ChannelError::ConnectionClosed`] when the remote side drops
    /// the connection.
    async fn recv(&self) -> Result<Vec<u8>, ChannelError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), ChannelError>;
}
