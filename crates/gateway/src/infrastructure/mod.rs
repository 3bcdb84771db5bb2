//! Infrastructure Layer - Adapters to the telemetry server and the store
//!
//! - WsTransport: WebSocket socket endpoint
//! - LoopbackTransport: in-process transport for local wiring and tests
//! - RestEventFetcher: HTTP pull API
//! - FrameParser: wire JSON to domain frames
//! - InMemoryPersistence / InMemoryFetcher: in-memory collaborators

pub mod loopback;
pub mod memory;
pub mod parsers;
pub mod rest_client;
pub mod ws_transport;

pub use loopback::{LoopbackServer, LoopbackTransport};
pub use memory::{InMemoryFetcher, InMemoryPersistence};
pub use parsers::FrameParser;
pub use rest_client::{RestError, RestEventFetcher};
pub use ws_transport::WsTransport;
