use chrono::{Timelike, Utc};
use fleet_core::Timestamp;
use fleet_ports::Clock;
use parking_lot::Mutex;

/// Wall clock used by the running gateway
///
/// Readings are truncated to whole milliseconds, the resolution of the
/// server's fix and event times, and never go backwards: if the host clock
/// is stepped back the last reading is repeated until wall time catches up.
/// Backfill windows end at `now()`, so a backwards step would otherwise
/// produce a window ending before the anchor it starts from.
pub struct SystemClock {
    last: Mutex<Option<Timestamp>>,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            last: Mutex::new(None),
        }
    }

    fn observe(&self, wall: Timestamp) -> Timestamp {
        let millis = wall.nanosecond() / 1_000_000 * 1_000_000;
        let reading = wall.with_nanosecond(millis).unwrap_or(wall);

        let mut last = self.last.lock();
        let reading = match *last {
            Some(previous) if previous > reading => previous,
            _ => reading,
        };
        *last = Some(reading);
        reading
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.observe(Utc::now())
    }

    fn name(&self) -> &str {
        "SystemClock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_readings_have_millisecond_resolution() {
        let clock = SystemClock::new();
        let wall = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);

        let reading = clock.observe(wall);
        assert_eq!(reading.nanosecond(), 123_000_000);
        assert_eq!(clock.now().nanosecond() % 1_000_000, 0);
    }

    #[test]
    fn test_step_back_is_held_until_wall_time_catches_up() {
        let clock = SystemClock::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        assert_eq!(clock.observe(start), start);
        assert_eq!(clock.observe(start - Duration::seconds(30)), start);
        assert_eq!(
            clock.observe(start + Duration::milliseconds(5)),
            start + Duration::milliseconds(5)
        );
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = clock.now();

        assert!(second - first >= Duration::milliseconds(9));
    }
}
