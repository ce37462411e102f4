//! Configuration loading for offsync-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section may be omitted.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for offsync-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Lease limits.
    #[serde(default)]
    pub locks: LocksConfig,
    /// Change feed paging.
    #[serde(default)]
    pub sync: FeedConfig,
    /// Schema version advertised to clients.
    #[serde(default)]
    pub schema: SchemaConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Lease limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LocksConfig {
    /// Longest lease a client may ask for, in milliseconds (default: 5 minutes).
    /// Longer requests are clamped.
    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: u64,
}

/// Change feed paging.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Largest page served by `/sync/changes` (default: 1000).
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

/// Schema version advertised to clients.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Version served by `/schema/version` (default: 1).
    #[serde(default = "default_schema_version")]
    pub version: u32,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_max_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_page_size() -> u32 {
    1000
}

fn default_schema_version() -> u32 {
    1
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            max_ttl_ms: default_max_ttl_ms(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            version: default_schema_version(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.locks.max_ttl_ms, 300_000);
        assert_eq!(config.schema.version, 1);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[storage]
database = "/data/relay.db"

[locks]
max_ttl_ms = 60000

[schema]
version = 4

[cleanup]
interval_secs = 30
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.storage.database, PathBuf::from("/data/relay.db"));
        assert_eq!(config.locks.max_ttl_ms, 60_000);
        assert_eq!(config.schema.version, 4);
        assert_eq!(config.sync.max_page_size, 1000);
        assert_eq!(config.cleanup.interval_secs, 30);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.database, PathBuf::from("relay.db"));
        assert_eq!(config.cleanup.interval_secs, 60);
    }

    #[test]
    fn from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[schema]\nversion = \"two\"").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn from_file_missing() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
