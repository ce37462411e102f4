//! Mock channel for testing.
//!
//! Allows scripting inbound frames, dropping the connection and capturing
//! sent frames for verification.

use super::RealtimeChannel;
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::ChannelMessage;
use tokio::sync::Notify;

/// Mock channel for testing.
///
/// `recv()` waits until a frame is pushed or the connection is dropped.
#[derive(Debug, Default, Clone)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockChannelInner {
    connected: bool,
    connect_count: u32,
    sent_frames: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    auto_reply: bool,
}

impl MockChannel {
    /// Create a new mock channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `Subscribe` with `Subscribed` and `Ping` with `Pong`.
    pub fn with_auto_reply(self) -> Self {
        self.lock().auto_reply = true;
        self
    }

    /// Queue a frame for the next `recv()` call.
    pub fn push_inbound(&self, frame: Vec<u8>) {
        self.lock().inbound.push_back(frame);
        self.wake.notify_one();
    }

    /// Queue a message for the next `recv()` call.
    pub fn push_message(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        self.push_inbound(message.to_bytes()?);
        Ok(())
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    /// Decode every sent frame.
    pub fn sent_messages(&self) -> Vec<ChannelMessage> {
        self.lock()
            .sent_frames
            .iter()
            .filter_map(|f| ChannelMessage::from_bytes(f).ok())
            .collect()
    }

    /// Number of successful `connect()` calls.
    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    /// Simulate the remote side dropping the connection.
    pub fn drop_connection(&self) {
        self.lock().connected = false;
        self.wake.notify_one();
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, MockChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockChannelInner {
    fn auto_reply_to(&mut self, frame: &[u8]) {
        let reply = match ChannelMessage::from_bytes(frame) {
            Ok(ChannelMessage::Subscribe(sub)) => ChannelMessage::Subscribed {
                max_sequence: sub.last_sequence,
            },
            Ok(ChannelMessage::Ping) => ChannelMessage::Pong,
            _ => return,
        };
        if let Ok(bytes) = reply.to_bytes() {
            self.inbound.push_back(bytes);
        }
    }
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(ChannelError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connect_count += 1;
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        {
            let mut inner = self.lock();

            if !inner.connected {
                return Err(ChannelError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_send.take() {
                return Err(ChannelError::SendFailed(error));
            }

            inner.sent_frames.push(frame.to_vec());
            if inner.auto_reply {
                inner.auto_reply_to(frame);
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        loop {
            {
                let mut inner = self.lock();
                if !inner.connected {
                    return Err(ChannelError::ConnectionClosed);
                }
                if let Some(frame) = inner.inbound.pop_front() {
                    return Ok(frame);
                }
            }
            self.wake.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.lock().connected = false;
        self.wake.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sync_types::{DeviceId, Sequence, Subscribe, TenantId, UserId};

    #[tokio::test]
    async fn mock_channel_connects() {
        let channel = MockChannel::new();
        assert!(!channel.is_connected());

        channel.connect().await.unwrap();

        assert!(channel.is_connected());
        assert_eq!(channel.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_channel_records_sent_frames() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();

        channel.send(b"frame 1").await.unwrap();
        channel.send(b"frame 2").await.unwrap();

        let sent = channel.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], b"frame 2");
    }

    #[tokio::test]
    async fn recv_waits_for_pushed_frame() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();

        let pusher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push_inbound(b"late".to_vec());
        });

        let frame = tokio::time::timeout(Duration::from_secs(1), channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"late");
    }

    #[tokio::test]
    async fn drop_connection_wakes_receiver() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();

        let dropper = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dropper.drop_connection();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), channel.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let channel = MockChannel::new();
        let result = channel.send(b"data").await;
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let channel = MockChannel::new();
        channel.fail_next_connect("network unreachable");

        let result = channel.connect().await;
        assert!(matches!(result, Err(ChannelError::ConnectionFailed(_))));
        assert!(!channel.is_connected());

        // Next connect works
        channel.connect().await.unwrap();
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();
        channel.fail_next_send("buffer full");

        let result = channel.send(b"data").await;
        assert!(matches!(result, Err(ChannelError::SendFailed(_))));
        channel.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn auto_reply_answers_handshake_and_ping() {
        let channel = MockChannel::new().with_auto_reply();
        channel.connect().await.unwrap();

        let subscribe = ChannelMessage::Subscribe(Subscribe {
            tenant_id: TenantId::new("acme"),
            user_id: UserId::new("alice"),
            device_id: DeviceId::new(),
            last_sequence: Sequence::new(4),
        });
        channel.send(&subscribe.to_bytes().unwrap()).await.unwrap();
        channel
            .send(&ChannelMessage::Ping.to_bytes().unwrap())
            .await
            .unwrap();

        let first = ChannelMessage::from_bytes(&channel.recv().await.unwrap()).unwrap();
        let second = ChannelMessage::from_bytes(&channel.recv().await.unwrap()).unwrap();
        assert_eq!(
            first,
            ChannelMessage::Subscribed {
                max_sequence: Sequence::new(4)
            }
        );
        assert_eq!(second, ChannelMessage::Pong);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let channel1 = MockChannel::new();
        let channel2 = channel1.clone();

        channel1.connect().await.unwrap();
        assert!(channel2.is_connected());

        channel2.send(b"from 2").await.unwrap();
        assert_eq!(channel1.sent_frames().len(), 1);
    }
}
