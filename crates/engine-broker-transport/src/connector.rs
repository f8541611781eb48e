//! Socket seam between the transport actor and the network.

use std::collections::HashMap;

use async_trait::async_trait;
use engine_broker_core::EngineError;
use tokio::sync::mpsc;

/// One open socket, seen as a pair of text-frame channels.
///
/// The inbound channel closing means the socket is gone. Dropping `outbound`
/// asks the connector to close the socket.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Create a link and the peer-side ends of its channels.
    #[must_use]
    pub fn pair() -> (Self, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }
}

/// The socket side of a `Link`, driven by a connector's pump task.
#[derive(Debug)]
pub struct LinkPeer {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<String>,
}

/// Opens sockets to engine endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `endpoint`, sending `headers` with the handshake.
    ///
    /// # Errors
    /// Returns `EngineError::Connection` on refusal or handshake failure.
    async fn connect(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Link, EngineError>;
}
