use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::{EngineState, Position, PositionUpdate};
use crate::values::{DeviceId, PositionId, Timestamp};

/// Path a record arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Pushed over the persistent socket
    Live,
    /// Pulled by the fallback poller while the socket was down
    FallbackPoll,
    /// Recovered by the reconnect backfill
    Backfill,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Live => write!(f, "live"),
            Origin::FallbackPoll => write!(f, "fallback-poll"),
            Origin::Backfill => write!(f, "backfill"),
        }
    }
}

/// Latest known state of a single vehicle
///
/// One logical snapshot exists per device. Subscribers receive it as a
/// shared read-only value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub device_id: DeviceId,
    pub position_id: PositionId,
    pub position: Position,
    pub engine_state: EngineState,
    pub motion: bool,
    pub timestamp: Timestamp,
    pub origin: Origin,
}

impl VehicleSnapshot {
    pub fn from_update(update: &PositionUpdate, origin: Origin) -> Self {
        VehicleSnapshot {
            device_id: update.device_id,
            position_id: update.id,
            position: update.position,
            engine_state: update.engine_state,
            motion: update.motion,
            timestamp: update.timestamp,
            origin,
        }
    }

    /// Whether a record with `timestamp` may replace this snapshot
    /// without regressing the live view
    pub fn accepts(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_snapshot_accepts_equal_or_newer() {
        let now = Utc::now();
        let update = PositionUpdate::new(1, 7, Position::new(0.0, 0.0), now);
        let snapshot = VehicleSnapshot::from_update(&update, Origin::Live);

        assert!(snapshot.accepts(now));
        assert!(snapshot.accepts(now + Duration::seconds(1)));
        assert!(!snapshot.accepts(now - Duration::seconds(1)));
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::FallbackPoll.to_string(), "fallback-poll");
    }
}
