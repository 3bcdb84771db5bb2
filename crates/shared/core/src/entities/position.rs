use serde::{Deserialize, Serialize};

use crate::values::{DeviceId, PositionId, Timestamp};

/// Geographic fix reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Speed in knots
    pub speed: f64,
    /// Heading in degrees
    pub course: f64,
    pub altitude: Option<f64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Position {
            latitude,
            longitude,
            speed: 0.0,
            course: 0.0,
            altitude: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_course(mut self, course: f64) -> Self {
        self.course = course;
        self
    }
}

/// Ignition state as reported in position attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EngineState {
    On,
    Off,
    #[default]
    Unknown,
}

impl EngineState {
    pub fn from_ignition(ignition: Option<bool>) -> Self {
        match ignition {
            Some(true) => EngineState::On,
            Some(false) => EngineState::Off,
            None => EngineState::Unknown,
        }
    }
}

/// A single position report for a device, as delivered by the socket,
/// the fallback poll, or embedded in a backfilled event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub id: PositionId,
    pub device_id: DeviceId,
    pub position: Position,
    pub engine_state: EngineState,
    pub motion: bool,
    /// Device fix time
    pub timestamp: Timestamp,
}

impl PositionUpdate {
    pub fn new(
        id: impl Into<PositionId>,
        device_id: impl Into<DeviceId>,
        position: Position,
        timestamp: Timestamp,
    ) -> Self {
        PositionUpdate {
            id: id.into(),
            device_id: device_id.into(),
            position,
            engine_state: EngineState::Unknown,
            motion: false,
            timestamp,
        }
    }

    pub fn with_engine_state(mut self, engine_state: EngineState) -> Self {
        self.engine_state = engine_state;
        self
    }

    pub fn with_motion(mut self, motion: bool) -> Self {
        self.motion = motion;
        self
    }
}
