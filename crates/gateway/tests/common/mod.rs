//! Shared fixtures for the integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use fleet_clock::ManualClock;
use fleet_core::{Position, PositionUpdate, TelemetryEvent, Timestamp};
use fleet_gateway::{
    ConnectionConfig, ConnectionState, InMemoryFetcher, InMemoryPersistence, LoopbackServer,
    LoopbackTransport, TelemetryConfig, TelemetryService,
};

pub type LoopbackService = TelemetryService<LoopbackTransport, InMemoryFetcher, InMemoryPersistence>;

/// Fixed, whole-second base time
pub fn base_time() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

pub fn update(id: u64, device: u64, at: Timestamp) -> PositionUpdate {
    PositionUpdate::new(id, device, Position::new(38.72, -9.14), at)
}

pub fn event(id: u64, device: u64, at: Timestamp) -> TelemetryEvent {
    TelemetryEvent::new(id, device, "deviceMoving", at)
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new("loopback://fleet")
        .with_backoff(Duration::from_secs(1), Duration::from_secs(60))
        .with_circuit_breaker(5, Duration::from_secs(60))
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(15))
        .with_heartbeat_interval(Duration::from_secs(30))
}

/// `{"type":"positions",...}` frame for `(position id, device id, fix time)`
pub fn positions_frame(positions: &[(u64, u64, Timestamp)]) -> String {
    let positions: Vec<_> = positions
        .iter()
        .map(|(id, device, at)| {
            json!({
                "id": id,
                "deviceId": device,
                "latitude": 38.72,
                "longitude": -9.14,
                "speed": 10.0,
                "course": 180.0,
                "fixTime": at.to_rfc3339(),
                "attributes": {"ignition": true, "motion": true}
            })
        })
        .collect();

    json!({"type": "positions", "positions": positions}).to_string()
}

/// `{"type":"events",...}` frame for `(event id, device id, event time)`
pub fn events_frame(events: &[(u64, u64, Timestamp)]) -> String {
    let events: Vec<_> = events
        .iter()
        .map(|(id, device, at)| {
            json!({
                "id": id,
                "deviceId": device,
                "type": "ignitionOn",
                "eventTime": at.to_rfc3339()
            })
        })
        .collect();

    json!({"type": "events", "events": events}).to_string()
}

pub struct Harness {
    pub service: LoopbackService,
    pub transport: Arc<LoopbackTransport>,
    pub fetcher: Arc<InMemoryFetcher>,
    pub store: Arc<InMemoryPersistence>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_connection(config, connection_config())
    }

    pub fn with_connection(mut config: TelemetryConfig, connection: ConnectionConfig) -> Self {
        config.connection = connection;

        let transport = Arc::new(LoopbackTransport::new());
        let fetcher = Arc::new(InMemoryFetcher::new());
        let store = Arc::new(InMemoryPersistence::new());
        let clock = ManualClock::starting_at(base_time());

        let service = TelemetryService::new(
            config,
            Arc::clone(&transport),
            Arc::clone(&fetcher),
            Arc::clone(&store),
            Arc::new(clock.clone()),
        );

        Harness {
            service,
            transport,
            fetcher,
            store,
            clock,
        }
    }

    /// Accept the pending session and confirm it with a keep-alive
    pub async fn confirm_session(&self) -> LoopbackServer {
        let server = self.transport.accept().await.unwrap();
        assert!(server.send_text("{}").await);
        self.wait_for_state(ConnectionState::Connected).await;
        server
    }

    pub async fn wait_for_state(&self, expected: ConnectionState) {
        let mut state = self.service.connection_state();
        state.wait_for(|s| *s == expected).await.unwrap();
    }

    /// Let spawned tasks run without moving the clock far
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.service.repository().flush().await;
    }
}
