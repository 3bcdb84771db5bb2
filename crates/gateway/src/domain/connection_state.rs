use std::fmt;

/// Lifecycle state of the persistent socket session
///
/// Drives ingestion, fallback polling and backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session and no attempt in flight
    #[default]
    Disconnected,
    /// Transport opening, or open but not yet confirmed by the server
    Connecting,
    /// Confirmed by a first application message or heartbeat reply
    Connected,
    /// Network reported unavailable, reconnection suppressed until resume
    Paused,
    /// Too many failures (or a fatal one), waiting out the cooldown
    CircuitOpen,
}

impl ConnectionState {
    /// Check if live frames are flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a session or attempt is already underway
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Check if the state counts towards an outage window
    pub fn is_outage(&self) -> bool {
        !self.is_connected()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Paused => "PAUSED",
            ConnectionState::CircuitOpen => "CIRCUIT_OPEN",
        };
        write!(f, "{}", name)
    }
}
