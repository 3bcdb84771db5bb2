pub mod backfill;
pub mod connection_state;
pub mod dedup_window;
pub mod error;
pub mod events;
pub mod frames;
pub mod traits;

pub use backfill::{BackfillSummary, BackfillWindow, DeviceBackfillOutcome};
pub use connection_state::ConnectionState;
pub use dedup_window::{DedupWindow, RecordKey};
pub use error::{FrameParseError, TransportError};
pub use events::{BackfillCompleted, ConnectionEvent};
pub use frames::InboundFrame;
pub use traits::{OutboundMessage, Transport, TransportMessage, TransportSession};
