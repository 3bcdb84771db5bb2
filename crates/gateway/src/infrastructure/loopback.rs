use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    OutboundMessage, Transport, TransportError, TransportMessage, TransportSession,
};

const CHANNEL_CAPACITY: usize = 256;

/// In-process transport
///
/// Every successful `open` hands the server side of the session to whoever
/// calls `accept`. Failures can be scripted per attempt or made permanent.
pub struct LoopbackTransport {
    accepted_tx: mpsc::UnboundedSender<LoopbackServer>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackServer>>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
    permanent_failure: Mutex<Option<TransportError>>,
    opens: AtomicUsize,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        LoopbackTransport {
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            scripted_failures: Mutex::new(VecDeque::new()),
            permanent_failure: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    /// Fail the next open attempt with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Fail every open attempt until cleared with `None`
    pub fn fail_always(&self, error: Option<TransportError>) {
        *self.permanent_failure.lock() = error;
    }

    /// Number of `open` calls so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait for the next session a client opened
    pub async fn accept(&self) -> Option<LoopbackServer> {
        self.accepted_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportSession, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.permanent_failure.lock().clone() {
            return Err(error);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let server = LoopbackServer {
            endpoint: endpoint.to_string(),
            inbound: inbound_tx,
            outbound: tokio::sync::Mutex::new(outbound_rx),
            shutdown: shutdown.clone(),
        };
        if self.accepted_tx.send(server).is_err() {
            return Err(TransportError::Closed);
        }

        Ok(TransportSession {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shutdown,
        })
    }
}

/// Server side of a loopback session
pub struct LoopbackServer {
    endpoint: String,
    inbound: mpsc::Sender<TransportMessage>,
    outbound: tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>,
    shutdown: CancellationToken,
}

impl LoopbackServer {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push an application frame to the client. Returns false once the
    /// client side is gone.
    pub async fn send_text(&self, text: &str) -> bool {
        self.send(TransportMessage::Text(text.to_string())).await
    }

    pub async fn send_pong(&self) -> bool {
        self.send(TransportMessage::Pong).await
    }

    /// Push a server-initiated heartbeat
    pub async fn send_ping(&self) -> bool {
        self.send(TransportMessage::Ping).await
    }

    /// Close the session from the server side
    pub async fn close(&self, reason: Option<&str>) -> bool {
        self.send(TransportMessage::Closed(reason.map(str::to_string)))
            .await
    }

    /// Fail the session mid-stream
    pub async fn fail(&self, error: TransportError) -> bool {
        self.send(TransportMessage::Failed(error)).await
    }

    async fn send(&self, message: TransportMessage) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.inbound.send(message).await.is_ok()
    }

    /// Next message the client sent
    pub async fn next_outbound(&self) -> Option<OutboundMessage> {
        self.outbound.lock().await.recv().await
    }

    /// True once the client tore the session down
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.inbound.is_closed()
    }
}
