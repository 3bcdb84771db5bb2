use fleet_core::{PositionUpdate, TelemetryEvent};

/// Parsed inbound socket frame - core domain event
///
/// The server multiplexes several payload kinds over one socket, told apart
/// by a `type` field. Kinds this gateway does not understand are kept as
/// `Unrecognized` so the caller can log and drop them.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Batch of device position updates
    Positions(Vec<PositionUpdate>),
    /// Batch of discrete device events
    Events(Vec<TelemetryEvent>),
    /// Empty keep-alive object sent by the server
    KeepAlive,
    /// Well-formed frame of a kind we do not handle
    Unrecognized { kind: String },
}

impl InboundFrame {
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::Positions(_) => "positions",
            InboundFrame::Events(_) => "events",
            InboundFrame::KeepAlive => "keepalive",
            InboundFrame::Unrecognized { kind } => kind,
        }
    }

    /// Number of records carried by the frame
    pub fn len(&self) -> usize {
        match self {
            InboundFrame::Positions(positions) => positions.len(),
            InboundFrame::Events(events) => events.len(),
            InboundFrame::KeepAlive | InboundFrame::Unrecognized { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
