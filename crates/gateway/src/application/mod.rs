//! Application Layer - Connection lifecycle, reconciliation and fan-out
//!
//! - ConnectionManager: socket session with backoff and circuit breaking
//! - TelemetryRepository: merges live, fallback-poll and backfill data
//! - DeviceStreamRegistry: bounded per-device publish channels
//! - ReconnectBackfillCoordinator: recovers events missed during outages
//! - TelemetryService: wires the above together

pub mod backfill_coordinator;
pub mod config;
pub mod connection_manager;
pub mod reconnect_policy;
pub mod repository;
pub mod service;
pub mod stream_registry;
pub mod write_behind;

pub use backfill_coordinator::{BackfillRequest, ReconnectBackfillCoordinator};
pub use config::{
    BackfillConfig, ConnectionConfig, RegistryConfig, RepositoryConfig, TelemetryConfig,
};
pub use connection_manager::{ConnectOutcome, ConnectionManager};
pub use reconnect_policy::{Backoff, BreakerState, CircuitBreaker};
pub use repository::{MergeOutcome, RepositoryStats, TelemetryRepository};
pub use service::TelemetryService;
pub use stream_registry::{DeviceStreamRegistry, RegistryStats, SnapshotReceiver};
pub use write_behind::WriteBehind;
