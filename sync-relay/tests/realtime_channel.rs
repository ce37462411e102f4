//! The client's websocket channel against a live relay on a loopback port.

use offsync_relay::config::Config;
use offsync_relay::http::build_router;
use offsync_relay::server::SyncRelay;
use offsync_relay::storage::SqliteStorage;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_client::{
    ChangeSink, EngineEvent, HttpRemote, MemoryStore, RealtimeChannel, RemoteStore, SyncConfig,
    SyncEngine, WsChannel,
};
use sync_types::{
    CachedRecord, ChangeNotification, ChannelMessage, DeviceId, EntityKey, MutationId,
    MutationRequest, OperationType, Sequence, Subscribe, TenantId, UserId,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn spawn_relay() -> SocketAddr {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let relay = Arc::new(SyncRelay::new(Config::default(), storage));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(relay)).await.unwrap();
    });
    addr
}

fn create(tenant: &str, id: &str) -> MutationRequest {
    MutationRequest {
        mutation_id: MutationId::new(),
        tenant_id: TenantId::new(tenant),
        operation: OperationType::Create,
        entity: EntityKey::new("invoice", id),
        payload: b"{}".to_vec(),
        base_version: None,
        user_id: UserId::new("bob"),
        device_id: DeviceId::new(),
    }
}

async fn next(channel: &WsChannel) -> ChannelMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    ChannelMessage::from_bytes(&frame).unwrap()
}

#[tokio::test]
async fn channel_pushes_each_logged_change_once() {
    let addr = spawn_relay().await;
    let base = format!("http://{addr}");
    let remote = HttpRemote::new(&base, Duration::from_secs(5)).unwrap();
    remote.apply_mutation(&create("acme", "R0")).await.unwrap();

    let channel = WsChannel::for_relay(&base);
    channel.connect().await.unwrap();
    channel
        .send(
            &ChannelMessage::Subscribe(Subscribe {
                tenant_id: TenantId::new("acme"),
                user_id: UserId::new("alice"),
                device_id: DeviceId::new(),
                last_sequence: Sequence::zero(),
            })
            .to_bytes()
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        next(&channel).await,
        ChannelMessage::Subscribed {
            max_sequence: Sequence::new(1)
        }
    );

    let r1 = create("acme", "R1");
    remote.apply_mutation(&create("globex", "X")).await.unwrap();
    remote.apply_mutation(&r1).await.unwrap();
    match next(&channel).await {
        ChannelMessage::Change(change) => {
            assert_eq!(change.entity.entity_id, "R1");
            assert_eq!(change.mutation_id, r1.mutation_id);
            assert_eq!(change.sequence, Sequence::new(2));
        }
        other => panic!("expected change, got {other:?}"),
    }

    // A replayed mutation appends nothing, so the next frame is the pong.
    remote.apply_mutation(&r1).await.unwrap();
    channel
        .send(&ChannelMessage::Ping.to_bytes().unwrap())
        .await
        .unwrap();
    assert_eq!(next(&channel).await, ChannelMessage::Pong);

    channel.close().await.unwrap();
    assert!(!channel.is_connected());
}

#[derive(Default)]
struct Seen(Mutex<Vec<CachedRecord>>);

impl ChangeSink for Seen {
    fn on_change(&self, record: &CachedRecord, _change: &ChangeNotification) {
        self.0.lock().unwrap().push(record.clone());
    }
}

async fn device(base: &str, user: &str) -> SyncEngine {
    let config = SyncConfig::new(TenantId::new("acme"), UserId::new(user), DeviceId::new())
        .with_remote_url(base)
        .with_probe_intervals(Duration::from_millis(50), Duration::from_millis(50))
        .with_request_timeout(Duration::from_secs(2))
        .with_retry_jitter(Duration::ZERO);
    SyncEngine::open(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(HttpRemote::new(base, Duration::from_secs(2)).unwrap()),
        Arc::new(WsChannel::for_relay(base)),
        vec![],
    )
    .await
    .unwrap()
}

async fn wait_for(events: &mut broadcast::Receiver<EngineEvent>, wanted: EngineEvent) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while events.recv().await.unwrap() != wanted {}
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn engines_exchange_changes_through_relay() {
    let addr = spawn_relay().await;
    let base = format!("http://{addr}");
    let alice = device(&base, "alice").await;
    let bob = device(&base, "bob").await;
    let bob_seen = Arc::new(Seen::default());
    bob.subscribe("invoice", bob_seen.clone());

    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    alice.start().unwrap();
    bob.start().unwrap();
    wait_for(&mut alice_events, EngineEvent::Synced).await;
    wait_for(&mut bob_events, EngineEvent::Synced).await;

    alice
        .enqueue_mutation("invoice", "R1", OperationType::Create, b"{\"amount\":10}".to_vec())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while bob_seen.0.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let records = bob_seen.0.lock().unwrap().clone();
    assert_eq!(records[0].entity, EntityKey::new("invoice", "R1"));
    assert_eq!(records[0].payload, b"{\"amount\":10}");

    alice.shutdown().await;
    bob.shutdown().await;
}
