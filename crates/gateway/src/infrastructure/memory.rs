use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use fleet_core::{
    DeviceId, EventId, PositionId, PositionUpdate, TelemetryEvent, Timestamp, VehicleSnapshot,
};
use fleet_ports::{
    EventFetchService, FetchError, FetchResult, PersistenceError, PersistenceGateway,
    PersistenceResult,
};

/// DashMap-backed persistence gateway
///
/// Stands in for the external store when wiring the service locally and in
/// tests. Can be switched unavailable to exercise write failures.
pub struct InMemoryPersistence {
    snapshots: DashMap<DeviceId, VehicleSnapshot>,
    anchors: DashMap<DeviceId, Timestamp>,
    events: DashMap<(DeviceId, EventId), TelemetryEvent>,
    positions: DashMap<(DeviceId, PositionId), PositionUpdate>,
    available: AtomicBool,
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        InMemoryPersistence {
            snapshots: DashMap::new(),
            anchors: DashMap::new(),
            events: DashMap::new(),
            positions: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> PersistenceResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable("store offline".to_string()))
        }
    }

    pub fn snapshot(&self, device_id: DeviceId) -> Option<VehicleSnapshot> {
        self.snapshots.get(&device_id).map(|entry| entry.value().clone())
    }

    pub fn anchor(&self, device_id: DeviceId) -> Option<Timestamp> {
        self.anchors.get(&device_id).map(|entry| *entry.value())
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Stored events of a device, oldest first
    pub fn events_for(&self, device_id: DeviceId) -> Vec<TelemetryEvent> {
        let mut events: Vec<TelemetryEvent> = self
            .events
            .iter()
            .filter(|entry| entry.key().0 == device_id)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|event| (event.timestamp, event.id));
        events
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn upsert_snapshot(
        &self,
        device_id: DeviceId,
        snapshot: &VehicleSnapshot,
    ) -> PersistenceResult<()> {
        self.check_available()?;
        self.snapshots.insert(device_id, snapshot.clone());
        Ok(())
    }

    async fn get_replay_anchor(&self, device_id: DeviceId) -> PersistenceResult<Option<Timestamp>> {
        self.check_available()?;
        Ok(self.anchor(device_id))
    }

    async fn set_replay_anchor(
        &self,
        device_id: DeviceId,
        timestamp: Timestamp,
    ) -> PersistenceResult<()> {
        self.check_available()?;
        self.anchors.insert(device_id, timestamp);
        Ok(())
    }

    async fn upsert_event(&self, event: &TelemetryEvent) -> PersistenceResult<()> {
        self.check_available()?;
        self.events
            .insert((event.device_id, event.id), event.clone());
        Ok(())
    }

    async fn upsert_position(&self, update: &PositionUpdate) -> PersistenceResult<()> {
        self.check_available()?;
        self.positions
            .insert((update.device_id, update.id), update.clone());
        Ok(())
    }
}

/// Pull API served from memory
///
/// Holds per-device event history and latest positions. The generic
/// endpoint can be switched off (answers `NotSupported`) and individual
/// devices can be made to fail. Requested windows are recorded. With a
/// response delay set, every call sleeps first and concurrent calls are
/// counted.
pub struct InMemoryFetcher {
    events: DashMap<DeviceId, Vec<TelemetryEvent>>,
    positions: DashMap<DeviceId, PositionUpdate>,
    failing: DashMap<DeviceId, FetchError>,
    generic_supported: AtomicBool,
    generic_calls: AtomicUsize,
    device_calls: AtomicUsize,
    position_calls: AtomicUsize,
    windows: Mutex<Vec<(DeviceId, Timestamp, Timestamp)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Marks one call in flight until dropped, completed or cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        InMemoryFetcher {
            events: DashMap::new(),
            positions: DashMap::new(),
            failing: DashMap::new(),
            generic_supported: AtomicBool::new(true),
            generic_calls: AtomicUsize::new(0),
            device_calls: AtomicUsize::new(0),
            position_calls: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering any call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Highest number of calls seen in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> InFlight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    pub fn add_event(&self, event: TelemetryEvent) {
        self.events.entry(event.device_id).or_default().push(event);
    }

    pub fn set_position(&self, update: PositionUpdate) {
        self.positions.insert(update.device_id, update);
    }

    pub fn set_generic_supported(&self, supported: bool) {
        self.generic_supported.store(supported, Ordering::SeqCst);
    }

    pub fn fail_device(&self, device_id: DeviceId, error: FetchError) {
        self.failing.insert(device_id, error);
    }

    pub fn recover_device(&self, device_id: DeviceId) {
        self.failing.remove(&device_id);
    }

    pub fn generic_calls(&self) -> usize {
        self.generic_calls.load(Ordering::SeqCst)
    }

    pub fn device_calls(&self) -> usize {
        self.device_calls.load(Ordering::SeqCst)
    }

    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }

    /// Windows requested so far, in call order
    pub fn requested_windows(&self) -> Vec<(DeviceId, Timestamp, Timestamp)> {
        self.windows.lock().clone()
    }

    fn events_in(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        self.windows.lock().push((device_id, from, to));

        if let Some(error) = self.failing.get(&device_id) {
            return Err(error.value().clone());
        }

        Ok(self
            .events
            .get(&device_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.timestamp >= from && event.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventFetchService for InMemoryFetcher {
    async fn fetch_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        self.generic_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.respond().await;
        if !self.generic_supported.load(Ordering::SeqCst) {
            return Err(FetchError::NotSupported("/api/reports/events".to_string()));
        }
        self.events_in(device_id, from, to)
    }

    async fn fetch_device_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        self.device_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.respond().await;
        self.events_in(device_id, from, to)
    }

    async fn fetch_position(&self, device_id: DeviceId) -> FetchResult<Option<PositionUpdate>> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.respond().await;
        if let Some(error) = self.failing.get(&device_id) {
            return Err(error.value().clone());
        }
        Ok(self.positions.get(&device_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_persistence_upserts_are_idempotent() {
        let store = InMemoryPersistence::new();
        let event = TelemetryEvent::new(1, 2, "geofenceEnter", Utc::now());

        store.upsert_event(&event).await.unwrap();
        store.upsert_event(&event).await.unwrap();

        assert_eq!(store.event_count(), 1);
        assert_eq!(store.events_for(DeviceId::new(2)), vec![event]);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryPersistence::new();
        store.set_available(false);

        assert!(matches!(
            store.get_replay_anchor(DeviceId::new(1)).await,
            Err(PersistenceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fetcher_filters_by_window() {
        let fetcher = InMemoryFetcher::new();
        let now = Utc::now();
        fetcher.add_event(TelemetryEvent::new(1, 1, "a", now - Duration::hours(2)));
        fetcher.add_event(TelemetryEvent::new(2, 1, "b", now - Duration::minutes(2)));

        let events = fetcher
            .fetch_events(DeviceId::new(1), now - Duration::hours(1), now)
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, EventId::new(2));
        assert_eq!(fetcher.requested_windows().len(), 1);
    }
}
