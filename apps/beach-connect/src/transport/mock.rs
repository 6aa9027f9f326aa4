//! In-process transport used by tests and demos.

use super::{
    ConnectRequest, EventChannel, Transport, TransportConnector, TransportError, TransportEvent,
    TransportId, TransportKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Semaphore, broadcast};

pub struct MockTransport {
    id: TransportId,
    events: EventChannel,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TransportId::next(),
            events: EventChannel::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        })
    }

    /// Inject an event as if the remote host produced it.
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        self.events.emit(TransportEvent::Close {
            reason: reason.to_string(),
        });
    }
}

/// Scriptable connector: counts attempts, fails on demand, and can hold
/// attempts until the test releases them.
#[derive(Default)]
pub struct MockConnector {
    attempts: AtomicUsize,
    requests: Mutex<Vec<ConnectRequest>>,
    failures: Mutex<VecDeque<TransportError>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    gate: Option<Semaphore>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose attempts block until [`MockConnector::release`].
    pub fn held() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, attempts: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(attempts);
        }
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Attempts started so far, including held and failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transports handed out so far.
    pub fn connections(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<MockTransport>> {
        self.transports.lock().get(index).cloned()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::Closed)?
                .forget();
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let transport = MockTransport::new();
        transport.emit(TransportEvent::Open);
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ResolvedCredentials;

    fn request() -> ConnectRequest {
        ConnectRequest {
            scope: "pb1".into(),
            session_id: "sess1".into(),
            credentials: ResolvedCredentials::default(),
            label: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn scripted_failure_then_success() {
        let connector = MockConnector::new();
        connector.fail_next(TransportError::Negotiation("offer timeout".into()));
        assert!(connector.connect(request()).await.is_err());
        let transport = connector.connect(request()).await.unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.connections(), 1);
        assert_eq!(transport.subscribe().recv().await.unwrap(), TransportEvent::Open);
    }

    #[test_timeout::tokio_timeout_test]
    async fn held_connects_wait_for_release() {
        let connector = Arc::new(MockConnector::held());
        let pending = tokio::spawn({
            let connector = connector.clone();
            async move { connector.connect(request()).await.map(|t| t.id()) }
        });
        while connector.attempts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.connections(), 0);
        connector.release(1);
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(connector.connections(), 1);
    }

    #[test]
    fn close_is_recorded_once() {
        let transport = MockTransport::new();
        let mut events = transport.subscribe();
        transport.close("first");
        transport.close("second");
        assert!(transport.is_closed());
        assert_eq!(transport.close_reason().as_deref(), Some("first"));
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::Close {
                reason: "first".into()
            }
        );
        assert!(events.try_recv().is_err());
    }
}
