//! offsync-relay binary entry point.
//!
//! Usage:
//! ```bash
//! offsync-relay --config relay.toml
//! offsync-relay --bind 127.0.0.1:9000 --database /tmp/relay.db
//! ```

use anyhow::Context;
use clap::Parser;
use offsync_relay::cleanup::spawn_cleanup_task;
use offsync_relay::config::Config;
use offsync_relay::server::SyncRelay;
use offsync_relay::storage::{SqliteStorage, SyncStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Remote store server for offsync.
#[derive(Parser, Debug)]
#[command(name = "offsync-relay", version, about)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when absent.
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override `server.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Override `storage.database`.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    if let Some(database) = cli.database {
        config.storage.database = database;
    }

    let storage = SqliteStorage::new(&config.storage.database)
        .await
        .with_context(|| format!("opening {}", config.storage.database.display()))?;
    let storage: Arc<dyn SyncStorage> = Arc::new(storage);

    let cleanup = spawn_cleanup_task(storage.clone(), config.cleanup.clone());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        schema_version = config.schema.version,
        database = %config.storage.database.display(),
        "starting offsync-relay"
    );

    let relay = Arc::new(SyncRelay::new(config, storage));
    let result = tokio::select! {
        result = relay.serve() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            signal.map_err(anyhow::Error::from)
        }
    };

    cleanup.abort();
    result
}
