//! The client's HTTP remote against a live relay on a loopback port.

use offsync_relay::config::Config;
use offsync_relay::http::build_router;
use offsync_relay::server::SyncRelay;
use offsync_relay::storage::SqliteStorage;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{HttpRemote, RemoteError, RemoteStore};
use sync_types::{
    DeviceId, EntityKey, LockRequest, MutationId, MutationRequest, OperationType, Sequence,
    TenantId, UserId, Version,
};
use tokio::net::TcpListener;

async fn spawn_relay(config: Config) -> HttpRemote {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let relay = Arc::new(SyncRelay::new(config, storage));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(relay)).await.unwrap();
    });
    HttpRemote::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap()
}

fn mutation(
    operation: OperationType,
    id: &str,
    payload: &str,
    base_version: Option<Version>,
) -> MutationRequest {
    MutationRequest {
        mutation_id: MutationId::new(),
        tenant_id: TenantId::new("acme"),
        operation,
        entity: EntityKey::new("invoice", id),
        payload: payload.as_bytes().to_vec(),
        base_version,
        user_id: UserId::new("alice"),
        device_id: DeviceId::new(),
    }
}

fn lock_request(user: &str, device_id: DeviceId) -> LockRequest {
    LockRequest {
        tenant_id: TenantId::new("acme"),
        user_id: UserId::new(user),
        device_id,
        lock_id: None,
        ttl_ms: 30_000,
    }
}

#[tokio::test]
async fn health_and_schema_version() {
    let mut config = Config::default();
    config.schema.version = 2;
    let remote = spawn_relay(config).await;

    let health = remote.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(remote.schema_version().await.unwrap(), 2);
}

#[tokio::test]
async fn mutations_replay_and_conflict() {
    let remote = spawn_relay(Config::default()).await;

    let create = mutation(OperationType::Create, "R1", r#"{"amount":10}"#, None);
    let ack = remote.apply_mutation(&create).await.unwrap();
    assert_eq!(ack.version, Version::new(1));

    // A lost ack is retried with the same mutation id.
    let replay = remote.apply_mutation(&create).await.unwrap();
    assert_eq!(replay, ack);

    let stale = mutation(OperationType::Update, "R1", r#"{"amount":99}"#, Some(Version::new(5)));
    match remote.apply_mutation(&stale).await {
        Err(RemoteError::MutationConflict(conflict)) => {
            assert_eq!(conflict.mutation_id, stale.mutation_id);
            assert_eq!(conflict.current_version, Some(Version::new(1)));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let page = remote
        .changes_since(&TenantId::new("acme"), Sequence::zero(), 100)
        .await
        .unwrap();
    assert_eq!(page.changes.len(), 1);
    assert_eq!(page.max_sequence, Sequence::new(1));
}

#[tokio::test]
async fn lease_errors_map_to_remote_errors() {
    let remote = spawn_relay(Config::default()).await;
    let entity = EntityKey::new("invoice", "R1");
    let alice = lock_request("alice", DeviceId::new());

    let lock = remote.acquire_lock(&entity, &alice).await.unwrap();

    match remote
        .acquire_lock(&entity, &lock_request("bob", DeviceId::new()))
        .await
    {
        Err(RemoteError::LockHeld { holder, .. }) => assert_eq!(holder.user_id.as_str(), "alice"),
        other => panic!("expected held, got {other:?}"),
    }

    let with_id = LockRequest {
        lock_id: Some(lock.id),
        ..alice
    };
    remote.renew_lock(&entity, &with_id).await.unwrap();
    remote.release_lock(&entity, &with_id).await.unwrap();

    assert!(matches!(
        remote.renew_lock(&entity, &with_id).await,
        Err(RemoteError::LockNotFound(id)) if id == lock.id
    ));
}
