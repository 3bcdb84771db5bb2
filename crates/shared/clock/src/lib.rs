//! Fleet Clock Infrastructure
//!
//! Provides wall-clock time sources for the gateway:
//!
//! - [`SystemClock`] - real UTC time for production
//! - [`ManualClock`] - frozen time that only moves when told to, for
//!   deterministic backfill-window and anchor tests
//!
//! ## Usage
//!
//! ```ignore
//! use fleet_clock::{ManualClock, Clock};
//! use chrono::Duration;
//!
//! let clock = ManualClock::starting_at(start);
//! clock.advance(Duration::minutes(10)); // simulate a ten minute outage
//! assert_eq!(clock.now(), start + Duration::minutes(10));
//! ```

mod manual;
mod system;

pub use manual::ManualClock;
pub use system::SystemClock;

// Re-export the Clock trait for convenience
pub use fleet_ports::Clock;
