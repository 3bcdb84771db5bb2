use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use fleet_core::{EngineState, Position, PositionUpdate, TelemetryEvent, Timestamp};

use crate::domain::{FrameParseError, InboundFrame};

/// Position object as sent by the telemetry server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PositionDto {
    id: u64,
    device_id: u64,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    course: f64,
    altitude: Option<f64>,
    fix_time: Timestamp,
    #[serde(default)]
    attributes: PositionAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PositionAttributes {
    ignition: Option<bool>,
    #[serde(default)]
    motion: bool,
}

impl PositionDto {
    pub(crate) fn fix_time(&self) -> Timestamp {
        self.fix_time
    }

    pub(crate) fn into_update(self) -> PositionUpdate {
        let mut position = Position::new(self.latitude, self.longitude)
            .with_speed(self.speed)
            .with_course(self.course);
        position.altitude = self.altitude;

        PositionUpdate::new(self.id, self.device_id, position, self.fix_time)
            .with_engine_state(EngineState::from_ignition(self.attributes.ignition))
            .with_motion(self.attributes.motion)
    }
}

/// Event object as sent by the telemetry server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventDto {
    id: u64,
    device_id: u64,
    #[serde(rename = "type")]
    kind: String,
    event_time: Timestamp,
    position: Option<PositionDto>,
    #[serde(default)]
    attributes: Value,
}

impl EventDto {
    pub(crate) fn into_event(self) -> TelemetryEvent {
        let event = TelemetryEvent::new(self.id, self.device_id, self.kind, self.event_time)
            .with_attributes(self.attributes);

        match self.position {
            Some(position) => event.with_position(position.into_update()),
            None => event,
        }
    }
}

/// Parser for inbound socket frames
///
/// Infrastructure component - turns the server's JSON into `InboundFrame`s.
/// `{}` is a keep-alive; a `type` we do not handle yields `Unrecognized`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameParser;

impl FrameParser {
    pub fn new() -> Self {
        FrameParser
    }

    pub fn parse(&self, raw: &str) -> Result<InboundFrame, FrameParseError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| FrameParseError::InvalidJson(e.to_string()))?;

        let Value::Object(mut object) = value else {
            return Err(FrameParseError::MissingType);
        };

        if object.is_empty() {
            return Ok(InboundFrame::KeepAlive);
        }

        let kind = match object.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(FrameParseError::MissingType),
        };

        match kind.as_str() {
            "positions" => {
                let dtos: Vec<PositionDto> = take_array(&mut object, &kind, "positions")?;
                Ok(InboundFrame::Positions(
                    dtos.into_iter().map(PositionDto::into_update).collect(),
                ))
            }
            "events" => {
                let dtos: Vec<EventDto> = take_array(&mut object, &kind, "events")?;
                Ok(InboundFrame::Events(
                    dtos.into_iter().map(EventDto::into_event).collect(),
                ))
            }
            _ => {
                debug!(kind = %kind, "No parser for frame type");
                Ok(InboundFrame::Unrecognized { kind })
            }
        }
    }
}

fn take_array<T: for<'de> Deserialize<'de>>(
    object: &mut Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<Vec<T>, FrameParseError> {
    let malformed = |reason: String| FrameParseError::Malformed {
        kind: kind.to_string(),
        reason,
    };

    let value = object
        .remove(field)
        .ok_or_else(|| malformed(format!("missing '{}' array", field)))?;

    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}
