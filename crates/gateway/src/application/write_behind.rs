use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

use fleet_core::{DeviceId, PositionUpdate, TelemetryEvent, Timestamp, VehicleSnapshot};
use fleet_ports::{PersistenceGateway, PersistenceResult};

/// Queued persistence operation
enum PersistOp {
    Snapshot(Arc<VehicleSnapshot>),
    Position(PositionUpdate),
    Event(TelemetryEvent),
    Anchor(DeviceId, Timestamp),
    Flush(oneshot::Sender<()>),
}

impl PersistOp {
    fn name(&self) -> &'static str {
        match self {
            PersistOp::Snapshot(_) => "snapshot",
            PersistOp::Position(_) => "position",
            PersistOp::Event(_) => "event",
            PersistOp::Anchor(..) => "anchor",
            PersistOp::Flush(_) => "flush",
        }
    }
}

/// Fire-and-forget writer in front of the persistence gateway
///
/// Writes are applied in submission order by a single task. Failures are
/// logged and counted; they never reach the ingestion path.
#[derive(Clone)]
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<PersistOp>,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WriteBehind {
    /// Spawn the writer task. It stops once every handle is dropped.
    pub fn spawn<P>(store: Arc<P>) -> Self
    where
        P: PersistenceGateway + ?Sized + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let written = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let written_count = Arc::clone(&written);
        let failed_count = Arc::clone(&failed);
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let name = op.name();
                let result: PersistenceResult<()> = match op {
                    PersistOp::Snapshot(snapshot) => {
                        store.upsert_snapshot(snapshot.device_id, &snapshot).await
                    }
                    PersistOp::Position(update) => store.upsert_position(&update).await,
                    PersistOp::Event(event) => store.upsert_event(&event).await,
                    PersistOp::Anchor(device_id, timestamp) => {
                        store.set_replay_anchor(device_id, timestamp).await
                    }
                    PersistOp::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };

                match result {
                    Ok(()) => {
                        written_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed_count.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Persisting {} failed: {}", name, e);
                    }
                }
            }
            tracing::debug!("Write-behind queue closed");
        });

        WriteBehind {
            tx,
            written,
            failed,
        }
    }

    fn submit(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Write-behind queue closed, dropping write");
        }
    }

    pub fn upsert_snapshot(&self, snapshot: Arc<VehicleSnapshot>) {
        self.submit(PersistOp::Snapshot(snapshot));
    }

    pub fn upsert_position(&self, update: PositionUpdate) {
        self.submit(PersistOp::Position(update));
    }

    pub fn upsert_event(&self, event: TelemetryEvent) {
        self.submit(PersistOp::Event(event));
    }

    pub fn set_replay_anchor(&self, device_id: DeviceId, timestamp: Timestamp) {
        self.submit(PersistOp::Anchor(device_id, timestamp));
    }

    /// Wait until every write submitted so far has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
