use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use fleet_core::{DeviceId, EventId, PositionId};

/// Identity of a record for duplicate detection across delivery paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Event(DeviceId, EventId),
    Position(DeviceId, PositionId),
}

/// Bounded set of recently seen record identifiers
///
/// Collapses the same record arriving over the socket, the fallback poll and
/// the reconnect backfill. Once full, the oldest identifier is forgotten
/// first (FIFO).
pub struct DedupWindow<K = RecordKey> {
    capacity: usize,
    seen: HashSet<K>,
    /// Insertion order, oldest at the front
    order: VecDeque<K>,
    evicted: u64,
}

impl<K> DedupWindow<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DedupWindow {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Record `key`. Returns true if it was not already in the window.
    pub fn insert(&mut self, key: K) -> bool {
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
            self.evicted += 1;
        }

        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of identifiers forgotten because the window was full
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
