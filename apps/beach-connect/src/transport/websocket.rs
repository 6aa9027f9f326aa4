use super::{
    ConnectRequest, EventChannel, Transport, TransportConnector, TransportError, TransportEvent,
    TransportId, TransportKind,
};
use crate::protocol;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace};
use url::Url;

/// Opens viewer WebSockets against a session server.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    session_server: Url,
}

impl WebSocketConnector {
    pub fn new(session_server: impl AsRef<str>) -> Result<Self, TransportError> {
        let raw = session_server.as_ref().trim();
        let session_server =
            Url::parse(raw).map_err(|err| TransportError::InvalidUrl(format!("{raw}: {err}")))?;
        match session_server.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(Self { session_server }),
            other => Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            ))),
        }
    }

    pub fn socket_url(&self, request: &ConnectRequest) -> Result<Url, TransportError> {
        let mut url = self.session_server.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        let raw = url.to_string();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(raw))?
            .pop_if_empty()
            .extend(["sessions", request.session_id.as_str(), "ws"]);
        {
            let mut query = url.query_pairs_mut();
            if let Some(passcode) = &request.credentials.passcode {
                query.append_pair("passcode", passcode);
            }
            if let Some(token) = &request.credentials.viewer_token {
                query.append_pair("viewer_token", token);
            }
            if let Some(label) = &request.label {
                query.append_pair("label", label);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TransportError> {
        let url = self.socket_url(&request)?;
        debug!(
            target = "connect::transport",
            session_id = %request.session_id,
            host = url.host_str().unwrap_or_default(),
            "opening websocket"
        );
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;

        let id = TransportId::next();
        let events = Arc::new(EventChannel::new());
        events.emit(TransportEvent::Open);
        if url.scheme() == "wss" {
            events.emit(TransportEvent::Secure {
                summary: "tls".into(),
            });
        }
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(run_socket(id, stream, close_rx, events.clone()));

        Ok(Arc::new(WebSocketTransport {
            id,
            events,
            close_tx: Mutex::new(Some(close_tx)),
        }))
    }
}

pub struct WebSocketTransport {
    id: TransportId,
    events: Arc<EventChannel>,
    close_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl Transport for WebSocketTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self, reason: &str) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(reason.to_string());
        }
    }
}

async fn run_socket(
    id: TransportId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut close_rx: oneshot::Receiver<String>,
    events: Arc<EventChannel>,
) {
    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            requested = &mut close_rx => {
                let reason = requested.unwrap_or_else(|_| "transport dropped".to_string());
                let _ = sink.send(Message::Close(None)).await;
                break reason;
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => forward_frame(id, &events, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => forward_frame(id, &events, &data),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "remote closed".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    events.emit(TransportEvent::Error {
                        message: err.to_string(),
                    });
                    break err.to_string();
                }
                None => break "stream ended".to_string(),
            }
        }
    };
    debug!(target = "connect::transport", transport = %id, %reason, "websocket closed");
    events.emit(TransportEvent::Close { reason });
}

fn forward_frame(id: TransportId, events: &EventChannel, bytes: &[u8]) {
    match protocol::decode(bytes) {
        Ok(frame) => events.emit(TransportEvent::Frame(frame)),
        Err(err) => trace!(
            target = "connect::transport",
            transport = %id,
            error = %err,
            "ignoring undecodable frame"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ResolvedCredentials;
    use crate::protocol::{RowFrame, TransportFrame};
    use axum::Router;
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, Query};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn request(passcode: Option<&str>, viewer_token: Option<&str>) -> ConnectRequest {
        ConnectRequest {
            scope: "pb1".into(),
            session_id: "sess-1".into(),
            credentials: ResolvedCredentials {
                passcode: passcode.map(str::to_string),
                viewer_token: viewer_token.map(str::to_string),
            },
            label: Some("tile a".into()),
        }
    }

    #[test]
    fn socket_url_maps_scheme_and_credentials() {
        let connector = WebSocketConnector::new("https://road.beach.sh/api/").unwrap();
        let url = connector
            .socket_url(&request(Some("ABC123"), Some("vt 1")))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://road.beach.sh/api/sessions/sess-1/ws?passcode=ABC123&viewer_token=vt+1&label=tile+a"
        );

        let local = WebSocketConnector::new("http://127.0.0.1:4132").unwrap();
        let mut bare = request(None, None);
        bare.label = None;
        assert_eq!(
            local.socket_url(&bare).unwrap().as_str(),
            "ws://127.0.0.1:4132/sessions/sess-1/ws"
        );
    }

    #[test]
    fn rejects_unusable_server_urls() {
        assert!(matches!(
            WebSocketConnector::new("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            WebSocketConnector::new("ftp://road.beach.sh"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    async fn host_socket(
        ws: WebSocketUpgrade,
        Path(session_id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_rows(socket, session_id, query))
    }

    async fn serve_rows(mut socket: WebSocket, session_id: String, query: HashMap<String, String>) {
        let greeting = format!(
            "{}:{}",
            session_id,
            query.get("passcode").cloned().unwrap_or_default()
        );
        let row = TransportFrame::Row(RowFrame {
            row: 0,
            seq: 1,
            text: greeting,
        });
        let _ = socket.send(WsMessage::Text(protocol::encode(&row))).await;
        let _ = socket.send(WsMessage::Text("garbage".into())).await;
        let _ = socket
            .send(WsMessage::Text(protocol::encode(&TransportFrame::Shutdown)))
            .await;
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, WsMessage::Close(_)) {
                break;
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn streams_frames_and_reports_local_close() {
        let router = Router::new().route("/sessions/:session_id/ws", get(host_socket));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let connector = WebSocketConnector::new(format!("http://{addr}")).unwrap();
        let transport = connector.connect(request(Some("ABC123"), None)).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::WebSocket);
        let mut events = transport.subscribe();

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Open);
        let TransportEvent::Frame(TransportFrame::Row(row)) = events.recv().await.unwrap() else {
            panic!("expected row frame");
        };
        assert_eq!(row.text, "sess-1:ABC123");
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Frame(TransportFrame::Shutdown)
        );

        transport.close("viewer left");
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Close {
                reason: "viewer left".into()
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn refused_connection_is_negotiation_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = WebSocketConnector::new(format!("http://{addr}")).unwrap();
        let err = match connector.connect(request(None, Some("vt"))).await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, TransportError::Negotiation(_)), "{err:?}");
    }
}
