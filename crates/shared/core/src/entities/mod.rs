mod anchor;
mod event;
mod position;
mod snapshot;

pub use anchor::ReplayAnchor;
pub use event::TelemetryEvent;
pub use position::{EngineState, Position, PositionUpdate};
pub use snapshot::{Origin, VehicleSnapshot};
