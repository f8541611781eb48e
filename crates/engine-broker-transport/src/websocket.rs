//! WebSocket connector for engine endpoints.

use std::collections::HashMap;

use async_trait::async_trait;
use engine_broker_core::EngineError;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::Message,
    },
};

use crate::connector::{Connector, Link, LinkPeer};

/// Connects over `ws://` or `wss://`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Link, EngineError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| EngineError::Connection(format!("Invalid endpoint {endpoint}: {e}")))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| EngineError::Connection(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Connection(format!("Invalid header value for {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| EngineError::Connection(format!("WebSocket connect failed: {e}")))?;

        tracing::debug!(endpoint, "WebSocket connected");

        let (link, peer) = Link::pair();
        tokio::spawn(pump(ws, peer));
        Ok(link)
    }
}

/// Shuttle frames between the socket and the link until either side goes away.
async fn pump(ws: WebSocketStream<MaybeTlsStream<TcpStream>>, mut peer: LinkPeer) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            outbound = peer.from_client.recv() => {
                let Some(text) = outbound else {
                    // Transport dropped its end: close politely
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!("WebSocket send failed: {e}");
                    break;
                }
            }
            inbound = stream.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "Engine closed the socket");
                        break;
                    }
                    Some(Ok(_)) => continue, // ping/pong handled by tungstenite
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        break;
                    }
                    None => break,
                };
                if peer.to_client.send(text).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use super::*;

    #[tokio::test]
    async fn test_ws_connector_round_trip_with_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (header_tx, header_rx) = tokio::sync::oneshot::channel::<Option<String>>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                let _ = header_tx.send(auth);
                Ok::<_, ErrorResponse>(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let (mut tx, mut rx) = ws.split();

            let incoming = rx.next().await.unwrap().unwrap();
            assert_eq!(incoming, Message::Text("{\"ping\":true}".into()));
            tx.send(Message::Text("{\"pong\":true}".into())).await.unwrap();
        });

        let headers = HashMap::from([("Authorization".to_string(), "Bearer t0k".to_string())]);
        let mut link = WsConnector::new()
            .connect(&format!("ws://{addr}"), &headers)
            .await
            .unwrap();

        link.outbound.send("{\"ping\":true}".to_string()).unwrap();
        let reply = link.inbound.recv().await.expect("should receive reply");
        assert_eq!(reply, "{\"pong\":true}");
        assert_eq!(header_rx.await.unwrap().as_deref(), Some("Bearer t0k"));

        server.await.unwrap();
        // Server task ended, so the socket is gone
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ws_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsConnector::new()
            .connect(&format!("ws://{addr}"), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_bad_endpoint() {
        let err = WsConnector::new()
            .connect("not a url", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(ref m) if m.contains("Invalid endpoint")));
    }
}
