use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::domain::{
    OutboundMessage, Transport, TransportError, TransportMessage, TransportSession,
};

/// Convert tungstenite errors to domain TransportError
impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
            tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// WebSocket transport for the telemetry server's socket endpoint
/// Infrastructure component - handles WebSocket communication
pub struct WsTransport {
    channel_capacity: usize,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl WsTransport {
    pub fn new(channel_capacity: usize) -> Self {
        WsTransport {
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Check the endpoint is a ws/wss URL whose host resolves
    async fn resolve(endpoint: &str) -> Result<Url, TransportError> {
        let url = Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{}: no host", endpoint)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let resolved = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| TransportError::Unresolvable(format!("{}: {}", host, e)))?
            .next()
            .is_some();
        if !resolved {
            return Err(TransportError::Unresolvable(host));
        }

        Ok(url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportSession, TransportError> {
        let url = Self::resolve(endpoint).await?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportMessage>(self.channel_capacity);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(32);
        let shutdown = CancellationToken::new();

        // Outgoing: pings and text until shutdown, then a close frame
        let writer_shutdown = shutdown.clone();
        let writer_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    message = outbound_rx.recv() => message,
                };

                let frame = match message {
                    Some(OutboundMessage::Ping) => Message::Ping(Default::default()),
                    Some(OutboundMessage::Text(text)) => Message::Text(text.into()),
                    None => break,
                };

                if let Err(e) = write.send(frame).await {
                    let _ = writer_inbound
                        .send(TransportMessage::Failed(TransportError::from(e)))
                        .await;
                    break;
                }
            }
        });

        // Incoming
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = read.next() => next,
                };

                let message = match next {
                    Some(Ok(Message::Text(text))) => TransportMessage::Text(text.as_str().to_string()),
                    Some(Ok(Message::Pong(_))) => TransportMessage::Pong,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string());
                        let _ = inbound_tx.send(TransportMessage::Closed(reason)).await;
                        break;
                    }
                    // tungstenite queues the pong reply itself
                    Some(Ok(Message::Ping(_))) => TransportMessage::Ping,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = inbound_tx
                            .send(TransportMessage::Failed(TransportError::from(e)))
                            .await;
                        break;
                    }
                    None => {
                        let _ = inbound_tx.send(TransportMessage::Closed(None)).await;
                        break;
                    }
                };

                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(TransportSession {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shutdown,
        })
    }
}
