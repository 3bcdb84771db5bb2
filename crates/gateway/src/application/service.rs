use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use fleet_core::{DeviceId, TelemetryEvent, VehicleSnapshot};
use fleet_ports::{Clock, EventFetchService, PersistenceGateway};

use crate::domain::{BackfillCompleted, ConnectionState, Transport};

use super::config::TelemetryConfig;
use super::connection_manager::{ConnectOutcome, ConnectionManager};
use super::repository::{RepositoryStats, TelemetryRepository};
use super::stream_registry::{DeviceStreamRegistry, RegistryStats, SnapshotReceiver};

/// Explicitly constructed container owning every component
///
/// Wires the connection manager's event stream into the repository and
/// exposes the consumer-facing surface. Nothing here is global; several
/// services can run side by side.
pub struct TelemetryService<T, F, P>
where
    T: Transport,
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    connection: Arc<ConnectionManager<T>>,
    registry: Arc<DeviceStreamRegistry>,
    repository: Arc<TelemetryRepository<F, P>>,
}

impl<T, F, P> TelemetryService<T, F, P>
where
    T: Transport,
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    /// Must be called from within a Tokio runtime
    pub fn new(
        config: TelemetryConfig,
        transport: Arc<T>,
        fetcher: Arc<F>,
        store: Arc<P>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let TelemetryConfig {
            connection,
            registry,
            backfill,
            repository,
        } = config;

        let registry = Arc::new(DeviceStreamRegistry::new(registry));
        let connection = ConnectionManager::new(connection, transport);
        let repository = TelemetryRepository::new(
            repository,
            backfill,
            Arc::clone(&registry),
            fetcher,
            store,
            clock,
        );

        TelemetryService {
            connection,
            registry,
            repository,
        }
    }

    /// Start the idle sweeper and the repository, then connect
    pub async fn start(&self) -> ConnectOutcome {
        self.registry.start_sweeper();

        // Subscribe before connecting so no transition is missed
        let events = self.connection.subscribe_events();
        let state = self.connection.subscribe_state();
        self.repository.start(events, state).await;

        tracing::info!("Telemetry service started, connecting to {}", self.connection.endpoint());
        self.connection.connect()
    }

    /// Snapshot stream of one device
    pub fn subscribe(&self, device_id: DeviceId) -> Option<SnapshotReceiver> {
        self.repository.subscribe(device_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.repository.subscribe_events()
    }

    pub fn on_backfill_completed(&self) -> broadcast::Receiver<BackfillCompleted> {
        self.repository.on_backfill_completed()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn snapshot(&self, device_id: DeviceId) -> Option<Arc<VehicleSnapshot>> {
        self.repository.snapshot(device_id)
    }

    pub fn track_device(&self, device_id: DeviceId) {
        self.repository.track_device(device_id);
    }

    pub fn forget_device(&self, device_id: DeviceId) -> bool {
        self.repository.forget_device(device_id)
    }

    /// Network reported unavailable
    pub fn pause(&self) {
        self.connection.pause();
    }

    /// Network reported available again
    pub fn resume(&self) -> ConnectOutcome {
        self.connection.resume()
    }

    pub fn connect(&self) -> ConnectOutcome {
        self.connection.connect()
    }

    pub fn repository_stats(&self) -> RepositoryStats {
        self.repository.stats()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    pub fn repository(&self) -> &Arc<TelemetryRepository<F, P>> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<DeviceStreamRegistry> {
        &self.registry
    }

    /// Disconnect, drain queued writes and release every stream
    pub async fn shutdown(&self) {
        self.connection.dispose();
        self.repository.flush().await;
        self.repository.dispose();
        self.registry.dispose();
        tracing::info!("Telemetry service stopped");
    }
}
