use std::sync::Arc;
use tokio::time::Instant;

use super::backfill::BackfillSummary;
use super::connection_state::ConnectionState;

/// Events emitted by the connection manager, in the order they happened
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The session moved between lifecycle states
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
        at: Instant,
    },
    /// Raw application frame received on a confirmed session
    Frame(Arc<str>),
}

/// One-shot notification after a reconnect backfill finished
#[derive(Debug, Clone)]
pub struct BackfillCompleted {
    /// Novel events recovered from the outage window
    pub recovered_count: usize,
    pub summary: Arc<BackfillSummary>,
}
