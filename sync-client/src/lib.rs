//! # offsync-client
//!
//! Local-first sync engine for offsync.
//!
//! Applications keep writing while offline; mutations are persisted in a
//! durable outbox and replayed in order once connectivity returns. Records can
//! be locked for editing, with exclusive remote leases online and advisory
//! locks offline that are reconciled on reconnect. Remote changes arrive over a
//! realtime channel and are merged into the local cache.
//!
//! ## Components
//!
//! - [`ConnectionMonitor`]: health probes and Online/Offline/Reconnecting state
//! - [`SchemaSyncService`]: local migrations up to the remote schema version
//! - [`SyncQueue`]: durable, ordered, idempotent outbox
//! - [`RecordLockManager`]: remote leases with heartbeat renewal
//! - [`OfflineLockManager`]: advisory locks and their reconciliation
//! - [`RealtimeSyncHandler`]: change feed merge with echo suppression
//! - [`SyncEngine`]: the driver tying them together
//!
//! ## Example
//!
//! ```ignore
//! use offsync_client::{HttpRemote, SqliteStore, SyncConfig, SyncEngine, WsChannel};
//!
//! let config = SyncConfig::from_toml_str(&std::fs::read_to_string("offsync.toml")?)?;
//! let store = Arc::new(SqliteStore::open(Path::new("cache.db")).await?);
//! let remote = Arc::new(HttpRemote::new(&config.remote_url, config.request_timeout())?);
//! let channel = Arc::new(WsChannel::for_relay(&config.remote_url));
//! let engine = SyncEngine::open(config, store, remote, channel, migrations).await?;
//! engine.start()?;
//!
//! engine.enqueue_mutation("invoice", "R2", OperationType::Create, payload).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod monitor;
pub mod offline;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod schema;
pub mod store;

pub use channel::{MemoryChannel, MockChannel, RealtimeChannel, WsChannel};
pub use config::SyncConfig;
pub use engine::{EngineEvent, LockHandle, SyncEngine};
pub use error::{
    ChannelError, EngineError, ErrorKind, LockError, QueueError, RealtimeError, RemoteError,
    SchemaError, StoreError,
};
pub use locks::{PendingAcquire, RecordLockManager};
pub use monitor::{ConnectionHandler, ConnectionMonitor};
pub use offline::{DiscardedLock, OfflineLockManager, ReconcileReport};
pub use queue::{DrainFailure, DrainReport, SyncQueue};
pub use realtime::{ChangeRouter, ChangeSink, MergeStats, RealtimeEvent, RealtimeSyncHandler};
pub use remote::{HttpRemote, MemoryRemote, RemoteStore};
pub use schema::{Migration, SchemaSyncService};
pub use store::{LocalStore, MemoryStore, SqliteStore, StoreOp};

pub use sync_core::{ConnectionState, Resolution, Resolved};
