use chrono::{Duration, Utc};
use fleet_core::Timestamp;
use fleet_ports::Clock;
use parking_lot::RwLock;
use std::sync::Arc;

/// Clock that only advances when explicitly moved
///
/// Cloning shares the underlying time, so a test can hold one handle and
/// pass another to the component under test.
#[derive(Clone)]
pub struct ManualClock {
    current_time: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    /// Create a clock frozen at the current wall time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock frozen at `time`
    pub fn starting_at(time: Timestamp) -> Self {
        ManualClock {
            current_time: Arc::new(RwLock::new(time)),
        }
    }

    /// Move the clock forward by `duration`
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current_time.write();
        *current += duration;
    }

    /// Explicitly set the time
    ///
    /// Warning: This can move time backwards. Use with caution.
    pub fn set_time(&self, time: Timestamp) {
        *self.current_time.write() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current_time.read()
    }

    fn name(&self) -> &str {
        "ManualClock"
    }
}
