use async_trait::async_trait;
use fleet_core::{DeviceId, PositionUpdate, TelemetryEvent, Timestamp, VehicleSnapshot};

use crate::error::PersistenceResult;

/// Durable key-value store consumed by the ingestion core
///
/// Only the CRUD contract is defined here; the storage engine is external.
/// All writes are idempotent upserts keyed by device or record id.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store the last known snapshot of a device
    async fn upsert_snapshot(
        &self,
        device_id: DeviceId,
        snapshot: &VehicleSnapshot,
    ) -> PersistenceResult<()>;

    /// Read the persisted replay anchor of a device
    async fn get_replay_anchor(&self, device_id: DeviceId) -> PersistenceResult<Option<Timestamp>>;

    /// Persist the replay anchor of a device
    async fn set_replay_anchor(
        &self,
        device_id: DeviceId,
        timestamp: Timestamp,
    ) -> PersistenceResult<()>;

    /// Store an event record
    async fn upsert_event(&self, event: &TelemetryEvent) -> PersistenceResult<()>;

    /// Store a position record (history, independent of the live snapshot)
    async fn upsert_position(&self, update: &PositionUpdate) -> PersistenceResult<()>;
}
