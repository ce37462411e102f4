//! Websocket channel to the relay's `/sync/channel` endpoint.

use super::RealtimeChannel;
use crate::error::ChannelError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime channel over a websocket.
///
/// Frames travel as binary messages. The write and read halves are locked
/// separately so heartbeats can be sent while a `recv()` is pending.
pub struct WsChannel {
    url: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
    closing: Notify,
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl WsChannel {
    /// Channel to a full websocket URL (e.g. `ws://127.0.0.1:8080/sync/channel`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    /// Channel to the relay serving the REST API at `base_url`.
    pub fn for_relay(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self::new(format!("{base}/sync/channel"))
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn disconnect(&self) -> ChannelError {
        self.connected.store(false, Ordering::SeqCst);
        ChannelError::ConnectionClosed
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = socket.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(url = %self.url, "realtime websocket connected");
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(ChannelError::NotConnected)?;
        if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
            self.disconnect();
            return Err(ChannelError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        loop {
            if !self.is_connected() {
                return Err(ChannelError::ConnectionClosed);
            }
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(frame))) => return Ok(frame),
                    Some(Ok(Message::Close(_))) | None => return Err(self.disconnect()),
                    Some(Ok(Message::Text(_))) => {
                        return Err(ChannelError::Protocol("unexpected text frame".into()));
                    }
                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.disconnect();
                        return Err(ChannelError::ReceiveFailed(e.to_string()));
                    }
                },
                _ = self.closing.notified() => {}
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closing.notify_waiters();
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "websocket close handshake failed");
            }
        }
        *self.stream.lock().await = None;
        Ok(())
    }
}
