//! Fleet Gateway
//!
//! Telemetry client for a vehicle tracking server. Ingests position and
//! event updates pushed over a persistent socket, reconciles them with the
//! pull API while the socket is down or after it comes back, and fans out a
//! consistent per-device view to any number of consumers.
//!
//! # Architecture
//!
//! ```text
//!        Telemetry server
//!   WebSocket │        │ REST (poll / backfill)
//!             ▼        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                   TelemetryService                    │
//! │  ┌───────────────────┐                                │
//! │  │ ConnectionManager │ backoff, circuit breaker,      │
//! │  │                   │ heartbeat, pause/resume        │
//! │  └─────────┬─────────┘                                │
//! │            │ ConnectionEvent (state changes, frames)  │
//! │            ▼                                          │
//! │  ┌───────────────────┐   ┌──────────────────────────┐ │
//! │  │TelemetryRepository│──▶│ReconnectBackfillCoordin. │ │
//! │  │ merge, dedup,     │◀──│ gap windows, dedup merge │ │
//! │  │ debounce, polling │   └──────────────────────────┘ │
//! │  └────┬─────────┬────┘                                │
//! │       │         │ write-behind                        │
//! │       ▼         ▼                                     │
//! │  ┌──────────┐ ┌────────────────────┐                  │
//! │  │ Registry │ │ PersistenceGateway │                  │
//! │  └────┬─────┘ └────────────────────┘                  │
//! └───────┼──────────────────────────────────────────────┘
//!         │ Arc<VehicleSnapshot> per device
//!         ▼
//!    Consumers (panels, notification feeds)
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export key types
pub use domain::{
    BackfillCompleted, BackfillSummary, BackfillWindow, ConnectionEvent, ConnectionState,
    DedupWindow, DeviceBackfillOutcome, FrameParseError, InboundFrame, OutboundMessage,
    RecordKey, Transport, TransportError, TransportMessage, TransportSession,
};

pub use application::{
    Backoff, BackfillConfig, BackfillRequest, CircuitBreaker, ConnectOutcome, ConnectionConfig,
    ConnectionManager, DeviceStreamRegistry, MergeOutcome, ReconnectBackfillCoordinator,
    RegistryConfig, RegistryStats, RepositoryConfig, RepositoryStats, SnapshotReceiver,
    TelemetryConfig, TelemetryRepository, TelemetryService, WriteBehind,
};

pub use infrastructure::{
    FrameParser, InMemoryFetcher, InMemoryPersistence, LoopbackServer, LoopbackTransport,
    RestError, RestEventFetcher, WsTransport,
};

pub use config::{
    ConfigError, TelemetryConfigFile, load_config, load_config_from_str, load_default_config,
};
