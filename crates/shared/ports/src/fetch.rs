use async_trait::async_trait;
use fleet_core::{DeviceId, PositionUpdate, TelemetryEvent, Timestamp};

use crate::error::{FetchError, FetchResult};

/// Pull API for device history and current positions
///
/// Used by the fallback poller while the socket is down and by the
/// reconnect backfill to recover events missed during an outage.
#[async_trait]
pub trait EventFetchService: Send + Sync {
    /// Fetch events for a device through the generic (multi-device) endpoint
    async fn fetch_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>>;

    /// Fetch events for a device through the per-device endpoint
    async fn fetch_device_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>>;

    /// Fetch the latest position of a device, if it has one
    async fn fetch_position(&self, device_id: DeviceId) -> FetchResult<Option<PositionUpdate>>;

    /// Fetch events through the generic endpoint, falling back to the
    /// per-device endpoint when the generic one reports `NotSupported`
    async fn fetch_events_with_fallback(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        match self.fetch_events(device_id, from, to).await {
            Err(FetchError::NotSupported(_)) => {
                self.fetch_device_events(device_id, from, to).await
            }
            other => other,
        }
    }
}
