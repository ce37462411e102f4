//! Configuration for the sync engine.
//!
//! Every field has a default, so a TOML document only needs the identity
//! fields that differ per deployment:
//!
//! ```toml
//! remote_url = "https://sync.example.com"
//! tenant_id = "acme"
//! user_id = "alice"
//! lease_ttl_ms = 60000
//! ```

use serde::Deserialize;
use std::time::Duration;
use sync_core::Backoff;
use sync_types::{DeviceId, TenantId, UserId};

/// Configuration for [`SyncEngine`](crate::SyncEngine) and its components.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote store API.
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
    /// Tenant this device syncs.
    #[serde(default = "default_tenant_id")]
    pub tenant_id: TenantId,
    /// Signed-in user; also the echo filter identity.
    #[serde(default = "default_user_id")]
    pub user_id: UserId,
    /// This device. Generated when absent; persist it across restarts.
    #[serde(default)]
    pub device_id: DeviceId,

    /// Health probe interval while Online (default: 5s).
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Health probe interval while not Online (default: 2s).
    #[serde(default = "default_offline_retry_interval_ms")]
    pub offline_retry_interval_ms: u64,
    /// Health probe timeout (default: 3s).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before declaring Offline (default: 2).
    #[serde(default = "default_failures_before_offline")]
    pub failures_before_offline: u32,

    /// Timeout for every remote call (default: 10s).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Transient failures tolerated before a queue entry is quarantined (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay (default: 500ms).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Retry delay cap (default: 30s).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Random delay added on top of each retry (default: 250ms).
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Maximum queued mutations (default: 10000).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Record lock lease length (default: 30s). Renewed every third of it.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Requested lifetime of offline locks (default: 15 min).
    #[serde(default = "default_offline_lock_ttl_ms")]
    pub offline_lock_ttl_ms: u64,
    /// Hard ceiling on offline lock lifetime (default: 1 hour).
    #[serde(default = "default_offline_lock_ceiling_ms")]
    pub offline_lock_ceiling_ms: u64,

    /// Realtime ping interval (default: 20s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Changes fetched per resync page (default: 500).
    #[serde(default = "default_resync_page_size")]
    pub resync_page_size: u32,
}

fn default_remote_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_tenant_id() -> TenantId {
    TenantId::new("default")
}

fn default_user_id() -> UserId {
    UserId::new("anonymous")
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_offline_retry_interval_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_failures_before_offline() -> u32 {
    2
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_retry_jitter_ms() -> u64 {
    250
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_offline_lock_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_offline_lock_ceiling_ms() -> u64 {
    60 * 60 * 1000
}

fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

fn default_resync_page_size() -> u32 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            tenant_id: default_tenant_id(),
            user_id: default_user_id(),
            device_id: DeviceId::new(),
            probe_interval_ms: default_probe_interval_ms(),
            offline_retry_interval_ms: default_offline_retry_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failures_before_offline: default_failures_before_offline(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            max_queue_size: default_max_queue_size(),
            lease_ttl_ms: default_lease_ttl_ms(),
            offline_lock_ttl_ms: default_offline_lock_ttl_ms(),
            offline_lock_ceiling_ms: default_offline_lock_ceiling_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            resync_page_size: default_resync_page_size(),
        }
    }
}

impl SyncConfig {
    /// Create a configuration for one tenant, user and device.
    pub fn new(tenant_id: TenantId, user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            tenant_id,
            user_id,
            device_id,
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Set the remote store URL.
    pub fn with_remote_url(mut self, url: &str) -> Self {
        self.remote_url = url.to_string();
        self
    }

    /// Set the probe intervals (online, offline).
    pub fn with_probe_intervals(mut self, online: Duration, offline: Duration) -> Self {
        self.probe_interval_ms = online.as_millis() as u64;
        self.offline_retry_interval_ms = offline.as_millis() as u64;
        self
    }

    /// Set the consecutive failures needed to declare Offline.
    pub fn with_failures_before_offline(mut self, failures: u32) -> Self {
        self.failures_before_offline = failures;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_ms = base.as_millis() as u64;
        self.retry_max_ms = max.as_millis() as u64;
        self
    }

    /// Set the retry jitter.
    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// Set the record lock lease length.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the offline lock lifetime and its ceiling.
    pub fn with_offline_lock_ttl(mut self, ttl: Duration, ceiling: Duration) -> Self {
        self.offline_lock_ttl_ms = ttl.as_millis() as u64;
        self.offline_lock_ceiling_ms = ceiling.as_millis() as u64;
        self
    }

    /// Set the realtime ping interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Probe interval while Online.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Probe interval while not Online.
    pub fn offline_retry_interval(&self) -> Duration {
        Duration::from_millis(self.offline_retry_interval_ms)
    }

    /// Probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Remote call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Lease renewal interval: a third of the lease.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_ms / 3).max(1))
    }

    /// Realtime ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Backoff policy for queue retries, reconnects and schema retries.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
            Duration::from_millis(self.retry_jitter_ms),
        )
    }
}
