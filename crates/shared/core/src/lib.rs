//! Fleet Core Domain
//!
//! Pure domain types for the fleet telemetry gateway.
//! This crate contains no async, no I/O, and is 100% unit testable.

pub mod entities;
pub mod values;

// Re-export commonly used types at crate root
pub use entities::{
    EngineState, Origin, Position, PositionUpdate, ReplayAnchor, TelemetryEvent,
    VehicleSnapshot,
};
pub use values::{DeviceId, EventId, PositionId, Timestamp};
