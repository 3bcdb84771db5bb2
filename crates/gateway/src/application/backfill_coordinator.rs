use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use fleet_core::{DeviceId, ReplayAnchor, TelemetryEvent, Timestamp};
use fleet_ports::{EventFetchService, FetchError, FetchResult, PersistenceGateway};

use crate::domain::{BackfillSummary, BackfillWindow, DedupWindow, DeviceBackfillOutcome, RecordKey};

use super::config::BackfillConfig;
use super::write_behind::WriteBehind;

/// Device to backfill, with the anchor captured when the connection returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub device_id: DeviceId,
    /// None means "load from the persistence gateway"
    pub anchor: Option<Timestamp>,
}

impl BackfillRequest {
    pub fn new(device_id: DeviceId, anchor: Option<Timestamp>) -> Self {
        BackfillRequest { device_id, anchor }
    }
}

struct DevicePlan {
    device_id: DeviceId,
    anchor: Option<Timestamp>,
    window: BackfillWindow,
}

/// Recovers events missed while the socket was down
///
/// Per device the gap `[anchor - safety_margin, now]` (clamped to
/// `max_window`) is fetched through the pull API with bounded concurrency.
/// Results are merged against the shared dedup window: known ids are counted
/// as deduplicated, novel events are queued for storage. A failed device is
/// recorded in the summary without affecting the others.
pub struct ReconnectBackfillCoordinator<F, P>
where
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    config: BackfillConfig,
    fetcher: Arc<F>,
    store: Arc<P>,
    writer: WriteBehind,
}

impl<F, P> ReconnectBackfillCoordinator<F, P>
where
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    pub fn new(config: BackfillConfig, fetcher: Arc<F>, store: Arc<P>, writer: WriteBehind) -> Self {
        ReconnectBackfillCoordinator {
            config,
            fetcher,
            store,
            writer,
        }
    }

    /// Gap to fetch for a device anchored at `anchor`
    pub fn window_for(&self, anchor: Option<Timestamp>, now: Timestamp) -> BackfillWindow {
        // Spans reaching past the representable range clamp to it
        let floor = now
            .checked_sub_signed(self.config.max_window)
            .unwrap_or(Timestamp::MIN_UTC);
        let from = match anchor {
            Some(anchor) => anchor
                .checked_sub_signed(self.config.safety_margin)
                .unwrap_or(Timestamp::MIN_UTC)
                .max(floor),
            None => floor,
        };

        BackfillWindow {
            from: from.min(now),
            to: now,
        }
    }

    pub async fn run(
        &self,
        requests: Vec<BackfillRequest>,
        now: Timestamp,
        dedup: &Mutex<DedupWindow>,
        cancel: &CancellationToken,
    ) -> BackfillSummary {
        let mut summary = BackfillSummary {
            requested_devices: requests.len(),
            ..BackfillSummary::default()
        };

        let mut plans = Vec::with_capacity(requests.len());
        for request in requests {
            let anchor = match request.anchor {
                Some(anchor) => Some(anchor),
                None => self.load_anchor(request.device_id).await,
            };
            plans.push(DevicePlan {
                device_id: request.device_id,
                anchor,
                window: self.window_for(anchor, now),
            });
        }

        tracing::info!(
            "Backfilling {} devices (concurrency {})",
            plans.len(),
            self.config.concurrency
        );

        // Devices not yet merged; whatever is left on cancellation is discarded
        let mut pending: Vec<(DeviceId, Option<Timestamp>)> =
            plans.iter().map(|plan| (plan.device_id, plan.anchor)).collect();

        let fetcher = Arc::clone(&self.fetcher);
        let fetch_timeout = self.config.fetch_timeout;
        let mut results = futures_util::stream::iter(plans)
            .map(|plan| {
                let fetcher = Arc::clone(&fetcher);
                async move {
                    let fetch = fetcher.fetch_events_with_fallback(
                        plan.device_id,
                        plan.window.from,
                        plan.window.to,
                    );
                    let result = match tokio::time::timeout(fetch_timeout, fetch).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Network(format!(
                            "no response within {:?}",
                            fetch_timeout
                        ))),
                    };
                    (plan, result)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = results.next() => next,
            };
            let Some((plan, result)) = next else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }

            pending.retain(|(device_id, _)| *device_id != plan.device_id);
            self.merge_device(&mut summary, plan, result, dedup);
        }

        for (device_id, anchor) in pending {
            if let Some(anchor) = anchor {
                summary.anchors.insert(device_id, anchor);
            }
            summary
                .outcomes
                .insert(device_id, DeviceBackfillOutcome::Discarded);
        }

        tracing::info!(
            "Backfill finished: {} inserted, {} deduplicated, {} failed",
            summary.inserted_count,
            summary.deduped_count,
            summary.failed_devices.len()
        );

        summary
    }

    async fn load_anchor(&self, device_id: DeviceId) -> Option<Timestamp> {
        match self.store.get_replay_anchor(device_id).await {
            Ok(anchor) => anchor,
            Err(e) => {
                tracing::warn!("Could not load replay anchor for {}: {}", device_id, e);
                None
            }
        }
    }

    fn merge_device(
        &self,
        summary: &mut BackfillSummary,
        plan: DevicePlan,
        result: FetchResult<Vec<TelemetryEvent>>,
        dedup: &Mutex<DedupWindow>,
    ) {
        let DevicePlan {
            device_id,
            anchor,
            window,
        } = plan;

        let mut events = match result {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("Backfill for {} failed: {}", device_id, e);
                summary.failed_devices.push(device_id);
                summary.outcomes.insert(
                    device_id,
                    DeviceBackfillOutcome::Failed {
                        window,
                        reason: e.to_string(),
                    },
                );
                if let Some(anchor) = anchor {
                    summary.anchors.insert(device_id, anchor);
                }
                return;
            }
        };

        // Per-device arrival order is timestamp order
        events.sort_by_key(|event| event.timestamp);

        let fetched = events.len();
        let mut inserted = 0;
        let mut deduped = 0;
        let mut latest: Option<Timestamp> = None;

        for event in events {
            // Responses are keyed by the requested device
            if event.device_id != device_id {
                tracing::debug!(
                    "Ignoring event {} for {} in backfill of {}",
                    event.id,
                    event.device_id,
                    device_id
                );
                continue;
            }

            latest = Some(ReplayAnchor::merged(latest, event.timestamp));

            let novel = dedup
                .lock()
                .insert(RecordKey::Event(device_id, event.id));
            if !novel {
                deduped += 1;
                continue;
            }

            inserted += 1;
            if let Some(position) = &event.position {
                summary.recovered_positions.push(position.clone());
            }
            self.writer.upsert_event(event);
        }

        let advanced = match (anchor, latest) {
            (Some(anchor), Some(latest)) => Some(ReplayAnchor::merged(Some(anchor), latest)),
            (anchor, None) => anchor,
            (None, latest) => latest,
        };
        if let Some(advanced) = advanced {
            summary.anchors.insert(device_id, advanced);
        }

        summary.inserted_count += inserted;
        summary.deduped_count += deduped;
        summary.outcomes.insert(
            device_id,
            DeviceBackfillOutcome::Completed {
                window,
                fetched,
                inserted,
                deduped,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{InMemoryFetcher, InMemoryPersistence};
    use chrono::{Duration, Utc};

    type Coordinator = ReconnectBackfillCoordinator<InMemoryFetcher, InMemoryPersistence>;

    fn coordinator(fetcher: Arc<InMemoryFetcher>, store: Arc<InMemoryPersistence>) -> Coordinator {
        coordinator_with(BackfillConfig::default(), fetcher, store)
    }

    fn coordinator_with(
        config: BackfillConfig,
        fetcher: Arc<InMemoryFetcher>,
        store: Arc<InMemoryPersistence>,
    ) -> Coordinator {
        let writer = WriteBehind::spawn(Arc::clone(&store));
        ReconnectBackfillCoordinator::new(config, fetcher, store, writer)
    }

    fn requests(devices: u64, anchor: Timestamp) -> Vec<BackfillRequest> {
        (1..=devices)
            .map(|id| BackfillRequest::new(DeviceId::new(id), Some(anchor)))
            .collect()
    }

    #[tokio::test]
    async fn test_window_subtracts_margin_and_clamps() {
        let now = Utc::now();
        let backfill = coordinator(
            Arc::new(InMemoryFetcher::new()),
            Arc::new(InMemoryPersistence::new()),
        );

        let window = backfill.window_for(Some(now - Duration::minutes(10)), now);
        assert_eq!(window.from, now - Duration::minutes(15));
        assert_eq!(window.to, now);

        let window = backfill.window_for(Some(now - Duration::days(3)), now);
        assert_eq!(window.from, now - Duration::hours(24));

        let window = backfill.window_for(None, now);
        assert_eq!(window.from, now - Duration::hours(24));

        // Anchor ahead of local time
        let window = backfill.window_for(Some(now + Duration::hours(1)), now);
        assert_eq!(window.from, now);
    }

    #[tokio::test]
    async fn test_missing_anchor_loaded_from_store() {
        let now = Utc::now();
        let device = DeviceId::new(4);
        let fetcher = Arc::new(InMemoryFetcher::new());
        let store = Arc::new(InMemoryPersistence::new());
        store
            .set_replay_anchor(device, now - Duration::minutes(20))
            .await
            .unwrap();

        let backfill = coordinator(Arc::clone(&fetcher), store);
        let dedup = Mutex::new(DedupWindow::new(100));
        let summary = backfill
            .run(
                vec![BackfillRequest::new(device, None)],
                now,
                &dedup,
                &CancellationToken::new(),
            )
            .await;

        match summary.outcomes.get(&device) {
            Some(DeviceBackfillOutcome::Completed { window, .. }) => {
                assert_eq!(window.from, now - Duration::minutes(25));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(summary.anchors.get(&device), Some(&(now - Duration::minutes(20))));
    }

    #[tokio::test]
    async fn test_cancelled_run_discards_results() {
        let now = Utc::now();
        let device = DeviceId::new(1);
        let fetcher = Arc::new(InMemoryFetcher::new());
        fetcher.add_event(TelemetryEvent::new(1, device, "alarm", now - Duration::minutes(1)));

        let backfill = coordinator(Arc::clone(&fetcher), Arc::new(InMemoryPersistence::new()));
        let dedup = Mutex::new(DedupWindow::new(100));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = backfill
            .run(vec![BackfillRequest::new(device, Some(now))], now, &dedup, &cancel)
            .await;

        assert_eq!(summary.inserted_count, 0);
        assert_eq!(
            summary.outcomes.get(&device),
            Some(&DeviceBackfillOutcome::Discarded)
        );
        assert!(dedup.lock().is_empty());
    }

    #[tokio::test]
    async fn test_window_with_unbounded_spans_does_not_overflow() {
        let now = Utc::now();
        let config = BackfillConfig::default()
            .with_max_window(Duration::MAX)
            .with_safety_margin(Duration::MAX);
        let backfill = coordinator_with(
            config,
            Arc::new(InMemoryFetcher::new()),
            Arc::new(InMemoryPersistence::new()),
        );

        let window = backfill.window_for(Some(now - Duration::minutes(10)), now);
        assert_eq!(window.from, Timestamp::MIN_UTC);
        assert_eq!(window.to, now);

        let window = backfill.window_for(None, now);
        assert_eq!(window.from, Timestamp::MIN_UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_never_exceed_concurrency() {
        let now = Utc::now();
        let fetcher = Arc::new(InMemoryFetcher::new());
        fetcher.set_delay(std::time::Duration::from_secs(1));

        let config = BackfillConfig::default().with_concurrency(3);
        let backfill = coordinator_with(config, Arc::clone(&fetcher), Arc::new(InMemoryPersistence::new()));
        let dedup = Mutex::new(DedupWindow::new(100));

        let started = tokio::time::Instant::now();
        let summary = backfill
            .run(requests(10, now), now, &dedup, &CancellationToken::new())
            .await;

        assert_eq!(fetcher.max_in_flight(), 3);
        assert_eq!(fetcher.generic_calls(), 10);
        assert!(summary.is_complete());
        assert_eq!(summary.outcomes.len(), 10);
        // Four rounds of at most three one-second fetches
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(4));
        assert!(elapsed < std::time::Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_fetch_fails_device_after_timeout() {
        let now = Utc::now();
        let anchor = now - Duration::minutes(30);
        let fetcher = Arc::new(InMemoryFetcher::new());
        fetcher.set_delay(std::time::Duration::from_secs(120));

        let config = BackfillConfig::default()
            .with_concurrency(2)
            .with_fetch_timeout(std::time::Duration::from_secs(5));
        let backfill = coordinator_with(config, Arc::clone(&fetcher), Arc::new(InMemoryPersistence::new()));
        let dedup = Mutex::new(DedupWindow::new(100));

        let started = tokio::time::Instant::now();
        let summary = backfill
            .run(requests(3, anchor), now, &dedup, &CancellationToken::new())
            .await;

        assert!(started.elapsed() < std::time::Duration::from_secs(11));
        assert_eq!(summary.failed_devices.len(), 3);
        for id in 1..=3 {
            let device = DeviceId::new(id);
            assert!(matches!(
                summary.outcomes.get(&device),
                Some(DeviceBackfillOutcome::Failed { reason, .. }) if reason.contains("no response")
            ));
            assert_eq!(summary.anchors.get(&device), Some(&anchor));
        }
    }
}
