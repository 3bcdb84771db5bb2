use std::time::Duration;

use fleet_core::DeviceId;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Socket endpoint (ws:// or wss://)
    pub endpoint: String,
    /// First retry delay of the backoff ladder
    pub backoff_base: Duration,
    /// Upper bound of the backoff ladder
    pub backoff_cap: Duration,
    /// Consecutive failed attempts before the circuit opens
    pub circuit_failure_threshold: u32,
    /// How long the circuit stays open before one half-open retry
    pub circuit_cooldown: Duration,
    /// Maximum time for the transport to open
    pub connect_timeout: Duration,
    /// Maximum time between transport open and the first server message
    pub confirm_timeout: Duration,
    /// Ping interval on an open session; silence for twice this is a timeout
    pub heartbeat_interval: Duration,
    /// Capacity of the state/frame event stream
    pub event_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        ConnectionConfig {
            endpoint: endpoint.into(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.circuit_failure_threshold = failure_threshold;
        self.circuit_cooldown = cooldown;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, confirm: Duration) -> Self {
        self.connect_timeout = connect;
        self.confirm_timeout = confirm;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Configuration for the per-device stream registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent device streams
    pub max_entries: usize,
    /// Entries not requested for this long are swept
    pub idle_timeout: Duration,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Buffered snapshots per device channel
    pub channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_entries: 256,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

impl RegistryConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_idle_eviction(mut self, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Configuration for the reconnect backfill
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Subtracted from each anchor to absorb clock skew
    pub safety_margin: chrono::Duration,
    /// Windows never reach further back than this from now
    pub max_window: chrono::Duration,
    /// Maximum concurrent per-device fetches
    pub concurrency: usize,
    /// A device fetch running longer than this counts as failed
    pub fetch_timeout: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            safety_margin: chrono::Duration::minutes(5),
            max_window: chrono::Duration::hours(24),
            concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl BackfillConfig {
    pub fn with_safety_margin(mut self, margin: chrono::Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_max_window(mut self, max_window: chrono::Duration) -> Self {
        self.max_window = max_window;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Configuration for the telemetry repository
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Devices tracked from startup (more are tracked as they are observed)
    pub devices: Vec<DeviceId>,
    /// Coalescing window for per-device publishes
    pub debounce_window: Duration,
    /// How long the socket may be down before fallback polling starts
    pub poll_grace: Duration,
    /// Interval between fallback polls
    pub poll_interval: Duration,
    /// Per-device bound on one fallback poll request
    pub poll_timeout: Duration,
    /// Minimum outage that triggers a backfill on reconnect
    pub backfill_threshold: Duration,
    /// Backfill persisted anchors on the first confirmed connection
    pub backfill_on_startup: bool,
    /// Identifiers retained for duplicate detection
    pub dedup_capacity: usize,
    /// Capacity of the event and backfill notification channels
    pub notification_capacity: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            devices: Vec::new(),
            debounce_window: Duration::from_millis(250),
            poll_grace: Duration::from_secs(20),
            poll_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(10),
            backfill_threshold: Duration::from_secs(30),
            backfill_on_startup: true,
            dedup_capacity: 10_000,
            notification_capacity: 1024,
        }
    }
}

impl RepositoryConfig {
    pub fn with_devices(mut self, devices: Vec<DeviceId>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_polling(mut self, grace: Duration, interval: Duration) -> Self {
        self.poll_grace = grace;
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_backfill_threshold(mut self, threshold: Duration) -> Self {
        self.backfill_threshold = threshold;
        self
    }

    pub fn with_backfill_on_startup(mut self, enabled: bool) -> Self {
        self.backfill_on_startup = enabled;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }
}

/// Complete configuration of a telemetry service
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
    pub backfill: BackfillConfig,
    pub repository: RepositoryConfig,
}

impl TelemetryConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        TelemetryConfig {
            connection: ConnectionConfig::new(endpoint),
            registry: RegistryConfig::default(),
            backfill: BackfillConfig::default(),
            repository: RepositoryConfig::default(),
        }
    }
}
