use crate::credentials::ResolvedCredentials;
use crate::protocol::TransportFrame;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod mock;
pub mod websocket;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl TransportId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Mock => f.write_str("mock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Secure { summary: String },
    Frame(TransportFrame),
    Close { reason: String },
    Error { message: String },
    Status(String),
    SignalingClosed,
    SignalingError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport closed")]
    Closed,
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub scope: String,
    pub session_id: String,
    pub credentials: ResolvedCredentials,
    pub label: Option<String>,
}

/// An established connection to a session host.
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    /// Event stream for this transport. The first receiver also sees events
    /// emitted before it subscribed.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn close(&self, reason: &str);
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Broadcast fan-out that buffers events for the first subscriber.
pub(crate) struct EventChannel {
    sender: broadcast::Sender<TransportEvent>,
    first: Mutex<Option<broadcast::Receiver<TransportEvent>>>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (sender, first) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            first: Mutex::new(Some(first)),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.first
            .lock()
            .take()
            .unwrap_or_else(|| self.sender.subscribe())
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        // No receivers left means nobody is listening any more.
        let _ = self.sender.send(event);
    }
}
