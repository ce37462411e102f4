//! Channel attached to an in-process [`MemoryRemote`].

use super::RealtimeChannel;
use crate::error::ChannelError;
use crate::remote::MemoryRemote;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use sync_types::{ChangeNotification, ChannelMessage, TenantId};
use tokio::sync::{broadcast, watch, Notify};

/// Realtime channel fed by a [`MemoryRemote`]'s change broadcast.
///
/// Answers the handshake and pings like the real endpoint, forwards changes
/// of the subscribed tenant, and drops the connection when the remote is made
/// unreachable.
pub struct MemoryChannel {
    remote: MemoryRemote,
    session: tokio::sync::Mutex<Option<Session>>,
    tenant: Mutex<Option<TenantId>>,
    outbox: Mutex<VecDeque<Vec<u8>>>,
    connected: AtomicBool,
    wake: Notify,
}

struct Session {
    changes: broadcast::Receiver<ChangeNotification>,
    reachable: watch::Receiver<bool>,
}

impl MemoryChannel {
    /// Create a channel to `remote`. Call `connect()` before use.
    pub fn new(remote: MemoryRemote) -> Self {
        Self {
            remote,
            session: tokio::sync::Mutex::new(None),
            tenant: Mutex::new(None),
            outbox: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tenant(&self) -> Option<TenantId> {
        self.tenant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reply(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        self.outbox().push_back(message.to_bytes()?);
        self.wake.notify_one();
        Ok(())
    }

    fn disconnect(&self) -> ChannelError {
        self.connected.store(false, Ordering::SeqCst);
        ChannelError::ConnectionClosed
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if !self.remote.is_reachable() {
            return Err(ChannelError::ConnectionFailed("network down".into()));
        }
        *self.session.lock().await = Some(Session {
            changes: self.remote.subscribe_changes(),
            reachable: self.remote.watch_reachable(),
        });
        self.outbox().clear();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        if !self.remote.is_reachable() {
            return Err(self.disconnect());
        }
        match ChannelMessage::from_bytes(frame)? {
            ChannelMessage::Subscribe(subscribe) => {
                let max_sequence = self.remote.max_sequence(&subscribe.tenant_id);
                *self.tenant.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(subscribe.tenant_id);
                self.reply(ChannelMessage::Subscribed { max_sequence })
            }
            ChannelMessage::Ping => self.reply(ChannelMessage::Pong),
            other => Err(ChannelError::Protocol(format!(
                "unexpected client frame: {other:?}"
            ))),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        loop {
            if !self.is_connected() {
                return Err(ChannelError::ConnectionClosed);
            }
            if let Some(frame) = self.outbox().pop_front() {
                return Ok(frame);
            }

            tokio::select! {
                change = session.changes.recv() => match change {
                    Ok(change) => {
                        if self.tenant().as_ref() == Some(&change.tenant_id) {
                            return Ok(ChannelMessage::Change(change).to_bytes()?);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        self.disconnect();
                        return Err(ChannelError::ReceiveFailed(format!(
                            "fell behind by {missed} changes"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(self.disconnect()),
                },
                changed = session.reachable.changed() => {
                    if changed.is_err() || !*session.reachable.borrow() {
                        return Err(self.disconnect());
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        // Wake a pending recv() so it releases the session.
        self.wake.notify_one();
        *self.session.lock().await = None;
        Ok(())
    }
}
