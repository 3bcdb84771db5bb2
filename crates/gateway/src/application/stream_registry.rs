use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fleet_core::{DeviceId, VehicleSnapshot};

use super::config::RegistryConfig;

/// Snapshot stream handed to consumers
pub type SnapshotReceiver = broadcast::Receiver<Arc<VehicleSnapshot>>;

struct StreamEntry {
    sender: broadcast::Sender<Arc<VehicleSnapshot>>,
    last_access: Instant,
    /// Access order, breaks ties between equal access times
    seq: u64,
}

impl StreamEntry {
    fn lru_key(&self) -> (Instant, u64) {
        (self.last_access, self.seq)
    }
}

struct RegistryState {
    entries: HashMap<DeviceId, StreamEntry>,
    next_seq: u64,
    disposed: bool,
}

/// Eviction and creation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub created: u64,
    pub lru_evictions: u64,
    pub idle_evictions: u64,
}

/// Bounded map of per-device publish channels
///
/// The only component consumers subscribe to. Entries are created on the
/// first subscription request and destroyed by LRU eviction, the idle sweep,
/// `remove` or `dispose`. Destroying an entry drops its sender inside the
/// registry lock, so every receiver of that device observes a closed channel.
pub struct DeviceStreamRegistry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    created: AtomicU64,
    lru_evictions: AtomicU64,
    idle_evictions: AtomicU64,
    sweeper: CancellationToken,
}

impl DeviceStreamRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        DeviceStreamRegistry {
            config,
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                next_seq: 0,
                disposed: false,
            }),
            created: AtomicU64::new(0),
            lru_evictions: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
            sweeper: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.max_entries.max(1)
    }

    /// Subscribe to a device's snapshots, creating its stream if needed.
    ///
    /// Refreshes the entry's access time. When the registry is full, the
    /// least recently accessed entry is evicted first. Returns None after
    /// `dispose`.
    pub fn get_or_create(&self, device_id: DeviceId) -> Option<SnapshotReceiver> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.disposed {
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some(entry) = state.entries.get_mut(&device_id) {
            entry.last_access = now;
            entry.seq = seq;
            return Some(entry.sender.subscribe());
        }

        if state.entries.len() >= self.capacity() {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.lru_key())
                .map(|(device, _)| *device);

            if let Some(victim) = victim {
                // Dropping the sender closes the channel for its receivers
                state.entries.remove(&victim);
                self.lru_evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Evicted least recently used stream {}", victim);
            }
        }

        let (sender, receiver) = broadcast::channel(self.config.channel_capacity.max(1));
        state.entries.insert(
            device_id,
            StreamEntry {
                sender,
                last_access: now,
                seq,
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);

        Some(receiver)
    }

    /// Deliver a snapshot to the device's stream.
    ///
    /// No-op if nobody has requested the device. Returns the number of
    /// receivers that got it.
    pub fn publish(&self, device_id: DeviceId, snapshot: Arc<VehicleSnapshot>) -> usize {
        let state = self.state.lock();
        match state.entries.get(&device_id) {
            Some(entry) => entry.sender.send(snapshot).unwrap_or(0),
            None => 0,
        }
    }

    /// Destroy a device's stream. Returns true if it existed.
    pub fn remove(&self, device_id: DeviceId) -> bool {
        self.state.lock().entries.remove(&device_id).is_some()
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.state.lock().entries.contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.state.lock().entries.keys().copied().collect()
    }

    /// Remove every entry not accessed within the idle timeout.
    /// Returns the number of entries removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut state = self.state.lock();
        let before = state.entries.len();

        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_access) < idle_timeout);

        let removed = before - state.entries.len();
        if removed > 0 {
            self.idle_evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!("Swept {} idle device streams", removed);
        }
        removed
    }

    /// Run the idle sweep every `sweep_interval` until disposed
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let token = self.sweeper.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.sweep_idle(Instant::now());
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.created.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweeper and release every stream
    pub fn dispose(&self) {
        self.sweeper.cancel();
        let mut state = self.state.lock();
        state.disposed = true;
        state.entries.clear();
    }
}

impl Drop for DeviceStreamRegistry {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
