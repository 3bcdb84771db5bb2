use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fleet_core::{
    DeviceId, Origin, PositionUpdate, ReplayAnchor, TelemetryEvent, Timestamp, VehicleSnapshot,
};
use fleet_ports::{Clock, EventFetchService, PersistenceGateway};

use crate::domain::{
    BackfillCompleted, ConnectionEvent, ConnectionState, DedupWindow, InboundFrame, RecordKey,
};
use crate::infrastructure::FrameParser;

use super::backfill_coordinator::{BackfillRequest, ReconnectBackfillCoordinator};
use super::config::{BackfillConfig, RepositoryConfig};
use super::stream_registry::{DeviceStreamRegistry, SnapshotReceiver};
use super::write_behind::WriteBehind;

/// What a merge did to the device's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Already seen through another path; nothing written
    Duplicate,
    /// Stored and the live snapshot moved forward
    Advanced,
    /// Stored durably, older than the live snapshot
    StoredOnly,
    /// Poll result that arrived after the socket came back
    Discarded,
    Disposed,
}

/// Ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub positions_merged: u64,
    pub events_ingested: u64,
    pub duplicates: u64,
    pub stale_positions: u64,
    pub publishes: u64,
    pub polls: u64,
    pub backfills: u64,
}

#[derive(Default)]
struct DeviceState {
    snapshot: Option<Arc<VehicleSnapshot>>,
    anchor: Option<Timestamp>,
    /// Latest snapshot waiting for the debounce window to expire
    pending: Option<Arc<VehicleSnapshot>>,
    debounce_armed: bool,
}

struct RepositoryState {
    devices: HashMap<DeviceId, DeviceState>,
    connection: ConnectionState,
    /// When the current outage began; None while connected
    outage_started: Option<Instant>,
    ever_connected: bool,
    poll: Option<CancellationToken>,
    poll_generation: u64,
    backfill: Option<CancellationToken>,
    /// Reconnect that happened while a backfill was already running
    queued_backfill: Option<Vec<BackfillRequest>>,
    stats: RepositoryStats,
    disposed: bool,
}

/// Reconciliation core
///
/// Consumes connection state and frames, merges live, fallback-poll and
/// backfill data under the ordering and deduplication rules, publishes
/// snapshots through the registry and queues durable writes.
///
/// Merge rule: a device's live snapshot is replaced only by a position with
/// an equal or newer timestamp. Every novel position is written through;
/// older ones never touch the live view.
pub struct TelemetryRepository<F, P>
where
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    config: RepositoryConfig,
    registry: Arc<DeviceStreamRegistry>,
    fetcher: Arc<F>,
    store: Arc<P>,
    clock: Arc<dyn Clock>,
    writer: WriteBehind,
    backfill: ReconnectBackfillCoordinator<F, P>,
    parser: FrameParser,
    dedup: Mutex<DedupWindow>,
    state: Mutex<RepositoryState>,
    events_tx: broadcast::Sender<TelemetryEvent>,
    backfill_tx: broadcast::Sender<BackfillCompleted>,
    shutdown: CancellationToken,
}

impl<F, P> TelemetryRepository<F, P>
where
    F: EventFetchService + ?Sized + 'static,
    P: PersistenceGateway + ?Sized + 'static,
{
    /// Must be called from within a Tokio runtime (spawns the write-behind task)
    pub fn new(
        config: RepositoryConfig,
        backfill_config: BackfillConfig,
        registry: Arc<DeviceStreamRegistry>,
        fetcher: Arc<F>,
        store: Arc<P>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let writer = WriteBehind::spawn(Arc::clone(&store));
        let backfill = ReconnectBackfillCoordinator::new(
            backfill_config,
            Arc::clone(&fetcher),
            Arc::clone(&store),
            writer.clone(),
        );
        let (events_tx, _) = broadcast::channel(config.notification_capacity.max(1));
        let (backfill_tx, _) = broadcast::channel(16);

        let devices = config
            .devices
            .iter()
            .map(|device| (*device, DeviceState::default()))
            .collect();

        Arc::new(TelemetryRepository {
            dedup: Mutex::new(DedupWindow::new(config.dedup_capacity)),
            state: Mutex::new(RepositoryState {
                devices,
                connection: ConnectionState::Disconnected,
                outage_started: None,
                ever_connected: false,
                poll: None,
                poll_generation: 0,
                backfill: None,
                queued_backfill: None,
                stats: RepositoryStats::default(),
                disposed: false,
            }),
            config,
            registry,
            fetcher,
            store,
            clock,
            writer,
            backfill,
            parser: FrameParser::new(),
            events_tx,
            backfill_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Load persisted anchors and start consuming connection events.
    ///
    /// `state` must be subscribed together with `events`; its current value
    /// is the starting point and it is re-read whenever the event stream lags.
    pub async fn start(
        self: &Arc<Self>,
        events: broadcast::Receiver<ConnectionEvent>,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        let initial = *state.borrow_and_update();

        for device_id in self.tracked_devices() {
            match self.store.get_replay_anchor(device_id).await {
                Ok(Some(anchor)) => {
                    let mut st = self.state.lock();
                    let device = st.devices.entry(device_id).or_default();
                    device.anchor = Some(ReplayAnchor::merged(device.anchor, anchor));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Could not load replay anchor for {}: {}", device_id, e)
                }
            }
        }

        self.on_state_changed(initial, Instant::now());

        let repository = Arc::clone(self);
        tokio::spawn(async move {
            repository.run_event_loop(events, state).await;
        });
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(ConnectionEvent::StateChanged { current, at, .. }) => {
                    self.on_state_changed(current, at);
                }
                Ok(ConnectionEvent::Frame(raw)) => self.on_frame(&raw),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Repository lagged, {} connection events lost", skipped);
                    self.state.lock().stats.frames_dropped += skipped;

                    // Lost transitions are recovered from the latest published state
                    let current = *state.borrow_and_update();
                    self.on_state_changed(current, Instant::now());
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Repository event loop stopped");
    }

    /// Parse and merge one raw frame. Malformed frames are logged and dropped.
    pub fn on_frame(self: &Arc<Self>, raw: &str) {
        {
            let mut st = self.state.lock();
            if st.disposed {
                return;
            }
            st.stats.frames_received += 1;
        }

        let frame = match self.parser.parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                self.state.lock().stats.frames_dropped += 1;
                return;
            }
        };

        match frame {
            InboundFrame::Positions(positions) => {
                for update in positions {
                    self.merge_position(update, Origin::Live);
                }
            }
            InboundFrame::Events(events) => {
                for event in events {
                    self.ingest_event(event);
                }
            }
            InboundFrame::KeepAlive => tracing::trace!("keep-alive"),
            InboundFrame::Unrecognized { kind } => {
                tracing::debug!("Dropping frame of unknown type '{}'", kind);
                self.state.lock().stats.frames_dropped += 1;
            }
        }
    }

    /// React to a connection state transition
    pub fn on_state_changed(self: &Arc<Self>, current: ConnectionState, at: Instant) {
        let mut st = self.state.lock();
        if st.disposed {
            return;
        }

        let was_connected = st.connection.is_connected();
        st.connection = current;

        if current.is_connected() && !was_connected {
            self.stop_polling(&mut st);

            let outage = st
                .outage_started
                .take()
                .map(|started| at.saturating_duration_since(started))
                .unwrap_or_default();
            let first_connection = !st.ever_connected;
            st.ever_connected = true;

            // Anchors as they were at the moment the socket came back
            let requests: Vec<BackfillRequest> = if first_connection {
                if !self.config.backfill_on_startup {
                    return;
                }
                st.devices
                    .iter()
                    .filter_map(|(device_id, device)| {
                        device
                            .anchor
                            .map(|anchor| BackfillRequest::new(*device_id, Some(anchor)))
                    })
                    .collect()
            } else {
                if outage < self.config.backfill_threshold {
                    tracing::debug!("Outage of {:?} below backfill threshold", outage);
                    return;
                }
                st.devices
                    .iter()
                    .map(|(device_id, device)| BackfillRequest::new(*device_id, device.anchor))
                    .collect()
            };

            if requests.is_empty() {
                return;
            }

            if st.backfill.is_some() {
                tracing::info!("Backfill already running, queueing another pass");
                st.queued_backfill = Some(requests);
                return;
            }

            tracing::info!(
                "Connection restored after {:?}, backfilling {} devices",
                outage,
                requests.len()
            );
            self.start_backfill(&mut st, requests);
        } else if !current.is_connected() && st.outage_started.is_none() {
            st.outage_started = Some(at);
            self.start_polling(&mut st);
        }
    }

    fn start_backfill(self: &Arc<Self>, st: &mut RepositoryState, requests: Vec<BackfillRequest>) {
        let token = self.shutdown.child_token();
        st.backfill = Some(token.clone());

        let repository = Arc::clone(self);
        tokio::spawn(async move {
            repository.run_backfill(requests, token).await;
        });
    }

    async fn run_backfill(self: Arc<Self>, requests: Vec<BackfillRequest>, token: CancellationToken) {
        let now = self.clock.now();
        let summary = self.backfill.run(requests, now, &self.dedup, &token).await;

        if token.is_cancelled() || self.state.lock().disposed {
            tracing::debug!("Backfill results discarded");
            return;
        }

        for update in summary.recovered_positions.iter().cloned() {
            self.merge_position(update, Origin::Backfill);
        }

        {
            let mut st = self.state.lock();
            if st.disposed {
                return;
            }
            for (device_id, anchor) in &summary.anchors {
                let device = st.devices.entry(*device_id).or_default();
                Self::advance_anchor(&self.writer, device, *device_id, *anchor);
            }
            st.stats.backfills += 1;
            st.backfill = None;

            if let Some(queued) = st.queued_backfill.take() {
                self.start_backfill(&mut st, queued);
            }
        }

        let completed = BackfillCompleted {
            recovered_count: summary.inserted_count,
            summary: Arc::new(summary),
        };
        let _ = self.backfill_tx.send(completed);
    }

    fn start_polling(self: &Arc<Self>, st: &mut RepositoryState) {
        if st.poll.is_some() {
            return;
        }
        st.poll_generation += 1;
        let generation = st.poll_generation;
        let token = self.shutdown.child_token();
        st.poll = Some(token.clone());

        let repository = Arc::clone(self);
        tokio::spawn(async move {
            repository.run_poll_loop(generation, token).await;
        });
    }

    fn stop_polling(&self, st: &mut RepositoryState) {
        if let Some(token) = st.poll.take() {
            token.cancel();
            tracing::info!("Socket confirmed, fallback polling stopped");
        }
        st.poll_generation += 1;
    }

    async fn run_poll_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.poll_grace) => {}
        }

        tracing::warn!(
            "Socket down for {:?}, polling every {:?}",
            self.config.poll_grace,
            self.config.poll_interval
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.poll_once(generation).await,
            }
        }
    }

    async fn poll_once(self: &Arc<Self>, generation: u64) {
        {
            let mut st = self.state.lock();
            if st.disposed || st.poll_generation != generation {
                return;
            }
            st.stats.polls += 1;
        }

        for device_id in self.tracked_devices() {
            let fetch = self.fetcher.fetch_position(device_id);
            let Ok(result) = tokio::time::timeout(self.config.poll_timeout, fetch).await else {
                tracing::debug!("Poll for {} timed out", device_id);
                continue;
            };
            match result {
                Ok(Some(update)) => {
                    if self.merge_polled(update, generation) == MergeOutcome::Discarded {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Poll for {} failed: {}", device_id, e),
            }
        }
    }

    /// Merge a position under the ordering and deduplication rules
    pub fn merge_position(self: &Arc<Self>, update: PositionUpdate, origin: Origin) -> MergeOutcome {
        self.merge(update, origin, None)
    }

    fn merge_polled(self: &Arc<Self>, update: PositionUpdate, generation: u64) -> MergeOutcome {
        self.merge(update, Origin::FallbackPoll, Some(generation))
    }

    fn merge(
        self: &Arc<Self>,
        update: PositionUpdate,
        origin: Origin,
        poll_generation: Option<u64>,
    ) -> MergeOutcome {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.disposed {
            return MergeOutcome::Disposed;
        }
        if let Some(generation) = poll_generation
            && (st.poll_generation != generation || st.connection.is_connected())
        {
            return MergeOutcome::Discarded;
        }

        let device_id = update.device_id;
        if !self
            .dedup
            .lock()
            .insert(RecordKey::Position(device_id, update.id))
        {
            st.stats.duplicates += 1;
            return MergeOutcome::Duplicate;
        }
        st.stats.positions_merged += 1;

        let device = st.devices.entry(device_id).or_default();
        if origin == Origin::Live {
            Self::advance_anchor(&self.writer, device, device_id, update.timestamp);
        }

        let accepts = device
            .snapshot
            .as_ref()
            .is_none_or(|live| live.accepts(update.timestamp));
        let snapshot = accepts.then(|| Arc::new(VehicleSnapshot::from_update(&update, origin)));
        self.writer.upsert_position(update);

        let Some(snapshot) = snapshot else {
            st.stats.stale_positions += 1;
            tracing::debug!("Stale {} position for {} stored only", origin, device_id);
            return MergeOutcome::StoredOnly;
        };

        device.snapshot = Some(Arc::clone(&snapshot));
        self.writer.upsert_snapshot(Arc::clone(&snapshot));

        if self.config.debounce_window.is_zero() {
            st.stats.publishes += 1;
            self.registry.publish(device_id, snapshot);
        } else {
            device.pending = Some(snapshot);
            if !device.debounce_armed {
                device.debounce_armed = true;
                self.arm_debounce(device_id);
            }
        }

        MergeOutcome::Advanced
    }

    fn arm_debounce(self: &Arc<Self>, device_id: DeviceId) {
        let repository = Arc::clone(self);
        let window = self.config.debounce_window;
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => repository.flush_pending(device_id),
            }
        });
    }

    fn flush_pending(&self, device_id: DeviceId) {
        let mut st = self.state.lock();
        if st.disposed {
            return;
        }
        let Some(device) = st.devices.get_mut(&device_id) else {
            return;
        };
        device.debounce_armed = false;

        if let Some(snapshot) = device.pending.take() {
            st.stats.publishes += 1;
            self.registry.publish(device_id, snapshot);
        }
    }

    /// Store a live event, advance its device's anchor and re-broadcast it.
    ///
    /// `Duplicate` before anything is stored means the event id was already
    /// known. Once the event is stored the result is that of merging its
    /// embedded position, or `StoredOnly` when it carries none.
    pub fn ingest_event(self: &Arc<Self>, event: TelemetryEvent) -> MergeOutcome {
        let position = {
            let mut st = self.state.lock();
            if st.disposed {
                return MergeOutcome::Disposed;
            }

            let device_id = event.device_id;
            if !self.dedup.lock().insert(RecordKey::Event(device_id, event.id)) {
                st.stats.duplicates += 1;
                return MergeOutcome::Duplicate;
            }
            st.stats.events_ingested += 1;

            let device = st.devices.entry(device_id).or_default();
            Self::advance_anchor(&self.writer, device, device_id, event.timestamp);

            self.writer.upsert_event(event.clone());
            let position = event.position.clone();
            let _ = self.events_tx.send(event);
            position
        };

        match position {
            Some(update) => self.merge_position(update, Origin::Live),
            None => MergeOutcome::StoredOnly,
        }
    }

    fn advance_anchor(
        writer: &WriteBehind,
        device: &mut DeviceState,
        device_id: DeviceId,
        observed: Timestamp,
    ) {
        let merged = ReplayAnchor::merged(device.anchor, observed);
        if device.anchor != Some(merged) {
            device.anchor = Some(merged);
            writer.set_replay_anchor(device_id, merged);
        }
    }

    /// Subscribe to a device's snapshots; the device becomes tracked
    pub fn subscribe(&self, device_id: DeviceId) -> Option<SnapshotReceiver> {
        self.track_device(device_id);
        self.registry.get_or_create(device_id)
    }

    /// Notification feed of novel live events
    pub fn subscribe_events(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events_tx.subscribe()
    }

    pub fn on_backfill_completed(&self) -> broadcast::Receiver<BackfillCompleted> {
        self.backfill_tx.subscribe()
    }

    /// Current live snapshot of a device
    pub fn snapshot(&self, device_id: DeviceId) -> Option<Arc<VehicleSnapshot>> {
        self.state
            .lock()
            .devices
            .get(&device_id)
            .and_then(|device| device.snapshot.clone())
    }

    pub fn anchor(&self, device_id: DeviceId) -> Option<Timestamp> {
        self.state
            .lock()
            .devices
            .get(&device_id)
            .and_then(|device| device.anchor)
    }

    pub fn tracked_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.state.lock().devices.keys().copied().collect();
        devices.sort();
        devices
    }

    pub fn track_device(&self, device_id: DeviceId) {
        let mut st = self.state.lock();
        if !st.disposed {
            st.devices.entry(device_id).or_default();
        }
    }

    /// Drop a device's in-memory state and its stream
    pub fn forget_device(&self, device_id: DeviceId) -> bool {
        let existed = self.state.lock().devices.remove(&device_id).is_some();
        self.registry.remove(device_id);
        existed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().poll.is_some()
    }

    pub fn is_backfilling(&self) -> bool {
        self.state.lock().backfill.is_some()
    }

    pub fn stats(&self) -> RepositoryStats {
        self.state.lock().stats
    }

    /// Wait for every queued durable write
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Stop all tasks; later merges return `Disposed`
    pub fn dispose(&self) {
        let mut st = self.state.lock();
        if st.disposed {
            return;
        }
        st.disposed = true;
        st.poll = None;
        st.backfill = None;
        st.queued_backfill = None;
        for device in st.devices.values_mut() {
            device.pending = None;
            device.debounce_armed = false;
        }
        self.shutdown.cancel();
        tracing::info!("Telemetry repository disposed");
    }
}
