//! Fleet Ports
//!
//! Port definitions (traits) for the fleet telemetry gateway.
//! These define the boundaries between the ingestion core and its
//! external collaborators: the pull API, the durable store and time.

mod clock;
mod error;
mod fetch;
mod persistence;

pub use clock::Clock;
pub use error::{FetchError, FetchResult, PersistenceError, PersistenceResult};
pub use fetch::EventFetchService;
pub use persistence::PersistenceGateway;
