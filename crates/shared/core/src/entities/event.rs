use serde::{Deserialize, Serialize};

use super::position::PositionUpdate;
use crate::values::{DeviceId, EventId, Timestamp};

/// Discrete device event (ignition on, geofence exit, alarm, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: EventId,
    pub device_id: DeviceId,
    /// Server event type, e.g. "ignitionOn" or "geofenceExit"
    pub kind: String,
    pub timestamp: Timestamp,
    /// Position attached to the event, if the server resolved one
    pub position: Option<PositionUpdate>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(
        id: impl Into<EventId>,
        device_id: impl Into<DeviceId>,
        kind: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        TelemetryEvent {
            id: id.into(),
            device_id: device_id.into(),
            kind: kind.into(),
            timestamp,
            position: None,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_position(mut self, position: PositionUpdate) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }
}
