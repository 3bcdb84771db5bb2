use serde::{Deserialize, Serialize};
use std::time::Duration;

use fleet_core::DeviceId;

use crate::application::{
    BackfillConfig, ConnectionConfig, RegistryConfig, RepositoryConfig, TelemetryConfig,
};

/// Longest accepted backfill margin or window, one year
pub const MAX_BACKFILL_SPAN_SECS: i64 = 366 * 24 * 3600;

/// Root configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfigFile {
    pub server: ServerConfig,
    /// Devices tracked from startup
    #[serde(default)]
    pub devices: Vec<u64>,
    #[serde(default)]
    pub connection: ConnectionConfigJson,
    #[serde(default)]
    pub streams: StreamsConfigJson,
    #[serde(default)]
    pub backfill: BackfillConfigJson,
    #[serde(default)]
    pub ingestion: IngestionConfigJson,
}

/// Telemetry server endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket endpoint (ws:// or wss://)
    pub ws_url: String,
    /// Pull API base URL
    pub rest_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Connection lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfigJson {
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ConnectionConfigJson {
    fn default() -> Self {
        ConnectionConfigJson {
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            circuit_failure_threshold: default_circuit_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown(),
            connect_timeout_ms: default_connect_timeout(),
            confirm_timeout_ms: default_confirm_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ConnectionConfigJson {
    /// Convert to application-layer ConnectionConfig
    pub fn to_connection_config(&self, endpoint: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig::new(endpoint)
            .with_backoff(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_cap_ms),
            )
            .with_circuit_breaker(
                self.circuit_failure_threshold,
                Duration::from_millis(self.circuit_cooldown_ms),
            )
            .with_timeouts(
                Duration::from_millis(self.connect_timeout_ms),
                Duration::from_millis(self.confirm_timeout_ms),
            )
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_event_capacity(self.event_channel_capacity)
    }
}

/// Per-device stream registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfigJson {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_stream_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamsConfigJson {
    fn default() -> Self {
        StreamsConfigJson {
            max_entries: default_max_entries(),
            idle_eviction_ms: default_idle_eviction(),
            sweep_interval_ms: default_sweep_interval(),
            channel_capacity: default_stream_channel_capacity(),
        }
    }
}

impl StreamsConfigJson {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .with_max_entries(self.max_entries)
            .with_idle_eviction(
                Duration::from_millis(self.idle_eviction_ms),
                Duration::from_millis(self.sweep_interval_ms),
            )
            .with_channel_capacity(self.channel_capacity)
    }
}

/// Reconnect backfill settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfigJson {
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: i64,
    #[serde(default = "default_max_window")]
    pub max_window_secs: i64,
    #[serde(default = "default_backfill_threshold")]
    pub threshold_ms: u64,
    #[serde(default = "default_true")]
    pub on_startup: bool,
    #[serde(default = "default_backfill_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

impl Default for BackfillConfigJson {
    fn default() -> Self {
        BackfillConfigJson {
            safety_margin_secs: default_safety_margin(),
            max_window_secs: default_max_window(),
            threshold_ms: default_backfill_threshold(),
            on_startup: default_true(),
            concurrency: default_backfill_concurrency(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

impl BackfillConfigJson {
    pub fn to_backfill_config(&self) -> BackfillConfig {
        BackfillConfig::default()
            .with_safety_margin(span(self.safety_margin_secs))
            .with_max_window(span(self.max_window_secs))
            .with_concurrency(self.concurrency)
            .with_fetch_timeout(Duration::from_millis(self.fetch_timeout_ms))
    }
}

/// Seconds as a backfill span, clamped to `0..=MAX_BACKFILL_SPAN_SECS`
fn span(secs: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs.clamp(0, MAX_BACKFILL_SPAN_SECS)).unwrap_or_default()
}

/// Merge, debounce and fallback polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfigJson {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_grace")]
    pub poll_grace_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl Default for IngestionConfigJson {
    fn default() -> Self {
        IngestionConfigJson {
            debounce_ms: default_debounce(),
            poll_grace_ms: default_poll_grace(),
            poll_interval_ms: default_poll_interval(),
            dedup_capacity: default_dedup_capacity(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl TelemetryConfigFile {
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().copied().map(DeviceId::new).collect()
    }

    /// Convert to the application-level configuration
    pub fn to_telemetry_config(&self) -> TelemetryConfig {
        let repository = RepositoryConfig::default()
            .with_devices(self.device_ids())
            .with_debounce_window(Duration::from_millis(self.ingestion.debounce_ms))
            .with_polling(
                Duration::from_millis(self.ingestion.poll_grace_ms),
                Duration::from_millis(self.ingestion.poll_interval_ms),
            )
            .with_poll_timeout(Duration::from_millis(self.ingestion.poll_timeout_ms))
            .with_backfill_threshold(Duration::from_millis(self.backfill.threshold_ms))
            .with_backfill_on_startup(self.backfill.on_startup)
            .with_dedup_capacity(self.ingestion.dedup_capacity);

        TelemetryConfig {
            connection: self.connection.to_connection_config(&self.server.ws_url),
            registry: self.streams.to_registry_config(),
            backfill: self.backfill.to_backfill_config(),
            repository,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_cap() -> u64 {
    60_000
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_confirm_timeout() -> u64 {
    15_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_max_entries() -> usize {
    256
}

fn default_idle_eviction() -> u64 {
    600_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_stream_channel_capacity() -> usize {
    64
}

fn default_safety_margin() -> i64 {
    300
}

fn default_max_window() -> i64 {
    86_400
}

fn default_backfill_threshold() -> u64 {
    30_000
}

fn default_backfill_concurrency() -> usize {
    4
}

fn default_fetch_timeout() -> u64 {
    30_000
}

fn default_debounce() -> u64 {
    250
}

fn default_poll_grace() -> u64 {
    20_000
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_poll_timeout() -> u64 {
    10_000
}
