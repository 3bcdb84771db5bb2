use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::TransportError;

/// Message surfaced by an open transport session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// Application payload (JSON text)
    Text(String),
    /// Reply to a heartbeat ping
    Pong,
    /// Server-initiated heartbeat
    Ping,
    /// Peer closed the session
    Closed(Option<String>),
    /// Session failed mid-stream
    Failed(TransportError),
}

/// Message the client sends over an open session
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Ping,
    Text(String),
}

/// Handles for one open transport session
///
/// Dropping or cancelling `shutdown` tears the session down; implementations
/// stop their I/O tasks and release the socket.
pub struct TransportSession {
    pub inbound: mpsc::Receiver<TransportMessage>,
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub shutdown: CancellationToken,
}

impl TransportSession {
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Trait for opening persistent sockets
///
/// Implements Dependency Inversion - the connection manager depends on this
/// abstraction, the WebSocket and loopback transports implement it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session to `endpoint`.
    ///
    /// Returning `Ok` only means the transport is open; the connection is not
    /// considered established until the server sends something.
    async fn open(&self, endpoint: &str) -> Result<TransportSession, TransportError>;
}
