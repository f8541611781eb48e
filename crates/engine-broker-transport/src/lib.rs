//! Engine transport layer.
//!
//! Provides:
//! - Wire protocol (engine JSON-RPC frames)
//! - `Connector` seam and WebSocket connector (feature: websocket)
//! - `Transport` - persistent connection with call correlation, deadlines and reconnection
//! - In-process fake engine for tests (feature: test-util)

pub mod connector;
pub mod protocol;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use connector::{Connector, Link, LinkPeer};
pub use protocol::{Inbound, Notification, Request, Response};
pub use transport::{
    Transport, TransportEvent, TransportOptions, TransportState, TransportStatus,
};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
