//! Realtime change feed over a websocket.
//!
//! Frames are binary MessagePack [`ChannelMessage`]s. A session starts with a
//! `Subscribe` handshake, answered with `Subscribed` carrying the tenant's
//! highest sequence. From then on every change appended to that tenant's log
//! is pushed as a `Change` frame, in sequence order. `Ping` is answered with
//! `Pong`.

use crate::error::StorageError;
use crate::server::SyncRelay;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use sync_types::{ChannelMessage, Sequence, TenantId};
use tokio::sync::broadcast;

/// Subscribed tenant and the last sequence pushed to the client.
struct Cursor {
    tenant_id: TenantId,
    sent: Sequence,
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("socket closed: {0}")]
    Socket(#[from] axum::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("frame codec error: {0}")]
    Codec(#[from] sync_types::SyncError),
    #[error("unexpected client frame: {0}")]
    Protocol(String),
}

pub async fn channel_handler(
    Extension(relay): Extension<Arc<SyncRelay>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(relay, socket))
}

async fn handle_socket(relay: Arc<SyncRelay>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut appended = relay.subscribe_appended();
    let mut cursor: Option<Cursor> = None;

    loop {
        let result = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Binary(frame))) => {
                    handle_frame(&relay, &mut sender, &mut cursor, &frame).await
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(_))) => {
                    Err(SessionError::Protocol("text frames are not supported".into()))
                }
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => Err(e.into()),
            },
            wake = appended.recv() => match (wake, cursor.as_mut()) {
                (Ok(tenant_id), Some(cursor)) if tenant_id == cursor.tenant_id => {
                    forward_changes(&relay, &mut sender, cursor).await
                }
                // Missed wakeups: the log itself is the source of truth.
                (Err(broadcast::error::RecvError::Lagged(_)), Some(cursor)) => {
                    forward_changes(&relay, &mut sender, cursor).await
                }
                (Err(broadcast::error::RecvError::Closed), _) => break,
                _ => Ok(()),
            },
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "realtime session ended");
            break;
        }
    }

    let _ = sender.close().await;
}

async fn handle_frame(
    relay: &SyncRelay,
    sender: &mut SplitSink<WebSocket, Message>,
    cursor: &mut Option<Cursor>,
    frame: &[u8],
) -> Result<(), SessionError> {
    match ChannelMessage::from_bytes(frame)? {
        ChannelMessage::Subscribe(subscribe) => {
            let max_sequence = relay.storage().max_sequence(&subscribe.tenant_id).await?;
            tracing::debug!(
                tenant = %subscribe.tenant_id,
                user = %subscribe.user_id,
                last_sequence = subscribe.last_sequence.value(),
                max_sequence = max_sequence.value(),
                "realtime session subscribed"
            );
            *cursor = Some(Cursor {
                tenant_id: subscribe.tenant_id,
                sent: max_sequence,
            });
            send(sender, &ChannelMessage::Subscribed { max_sequence }).await
        }
        ChannelMessage::Ping => send(sender, &ChannelMessage::Pong).await,
        other => Err(SessionError::Protocol(format!("{other:?}"))),
    }
}

/// Push every logged change above the cursor.
async fn forward_changes(
    relay: &SyncRelay,
    sender: &mut SplitSink<WebSocket, Message>,
    cursor: &mut Cursor,
) -> Result<(), SessionError> {
    let limit = relay.config().sync.max_page_size.max(1);
    loop {
        let page = relay
            .storage()
            .changes_since(&cursor.tenant_id, cursor.sent, limit)
            .await?;
        for change in page.changes {
            cursor.sent = change.sequence;
            send(sender, &ChannelMessage::Change(change)).await?;
        }
        if !page.has_more {
            return Ok(());
        }
    }
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ChannelMessage,
) -> Result<(), SessionError> {
    sender.send(Message::Binary(message.to_bytes()?)).await?;
    Ok(())
}
