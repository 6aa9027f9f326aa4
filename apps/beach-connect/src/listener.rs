//! Forwards a transport's event stream into session entry state.

use crate::registry::entry::EntryId;
use crate::transport::{Transport, TransportEvent};
use std::sync::Weak;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Where an event came from: the entry and which of its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOrigin {
    pub entry: EntryId,
    pub connection: u64,
}

pub trait TransportEventSink: Send + Sync + 'static {
    fn handle_event(&self, origin: EventOrigin, event: TransportEvent);

    /// `skipped` events were dropped before the listener could read them.
    /// The listener stops after reporting; the sink must resynchronize.
    fn handle_lag(&self, origin: EventOrigin, skipped: u64);
}

/// A running subscription to one transport on behalf of one entry.
#[derive(Debug)]
pub struct ListenerBundle {
    origin: EventOrigin,
    task: Option<JoinHandle<()>>,
}

impl ListenerBundle {
    /// Subscribe to `transport`, replacing whatever bundle `slot` held.
    pub fn attach<S: TransportEventSink>(
        slot: &mut Option<ListenerBundle>,
        transport: &dyn Transport,
        origin: EventOrigin,
        sink: Weak<S>,
    ) {
        if let Some(mut previous) = slot.take() {
            previous.detach();
        }
        let mut events = transport.subscribe();
        let transport_id = transport.id();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            target = "connect::listener",
                            entry = origin.entry.0,
                            transport = %transport_id,
                            skipped,
                            "listener lagged behind transport events"
                        );
                        if let Some(sink) = sink.upgrade() {
                            sink.handle_lag(origin, skipped);
                        }
                        break;
                    }
                    Err(RecvError::Closed) => TransportEvent::Close {
                        reason: "transport event stream ended".into(),
                    },
                };
                let closing = matches!(event, TransportEvent::Close { .. });
                let Some(sink) = sink.upgrade() else {
                    break;
                };
                sink.handle_event(origin, event);
                if closing {
                    break;
                }
            }
        });
        trace!(
            target = "connect::listener",
            entry = origin.entry.0,
            connection = origin.connection,
            transport = %transport_id,
            "listeners attached"
        );
        *slot = Some(ListenerBundle {
            origin,
            task: Some(task),
        });
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    pub fn is_attached(&self) -> bool {
        self.task.is_some()
    }

    /// Stop forwarding events. Safe to call more than once.
    pub fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            trace!(
                target = "connect::listener",
                entry = self.origin.entry.0,
                connection = self.origin.connection,
                "listeners detached"
            );
        }
    }
}

impl Drop for ListenerBundle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransportFrame;
    use crate::transport::mock::MockTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(EventOrigin, TransportEvent)>>,
        lags: Mutex<Vec<(EventOrigin, u64)>>,
    }

    impl TransportEventSink for RecordingSink {
        fn handle_event(&self, origin: EventOrigin, event: TransportEvent) {
            self.events.lock().push((origin, event));
        }

        fn handle_lag(&self, origin: EventOrigin, skipped: u64) {
            self.lags.lock().push((origin, skipped));
        }
    }

    impl RecordingSink {
        async fn wait_for(&self, count: usize) {
            while self.events.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn origin(connection: u64) -> EventOrigin {
        EventOrigin {
            entry: EntryId(7),
            connection,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn forwards_events_tagged_with_origin() {
        let sink = Arc::new(RecordingSink::default());
        let transport = MockTransport::new();
        transport.emit(TransportEvent::Open);
        let mut slot = None;
        ListenerBundle::attach(&mut slot, transport.as_ref(), origin(1), Arc::downgrade(&sink));

        transport.emit(TransportEvent::Frame(TransportFrame::Shutdown));
        sink.wait_for(2).await;
        let events = sink.events.lock().clone();
        assert_eq!(events[0], (origin(1), TransportEvent::Open));
        assert_eq!(
            events[1],
            (origin(1), TransportEvent::Frame(TransportFrame::Shutdown))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn attach_replaces_previous_bundle() {
        let sink = Arc::new(RecordingSink::default());
        let first = MockTransport::new();
        let second = MockTransport::new();
        let mut slot = None;
        ListenerBundle::attach(&mut slot, first.as_ref(), origin(1), Arc::downgrade(&sink));
        ListenerBundle::attach(&mut slot, second.as_ref(), origin(2), Arc::downgrade(&sink));
        assert_eq!(slot.as_ref().map(ListenerBundle::origin), Some(origin(2)));

        first.emit(TransportEvent::Status("stale".into()));
        second.emit(TransportEvent::Status("fresh".into()));
        sink.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let statuses: Vec<_> = sink
            .events
            .lock()
            .iter()
            .filter_map(|(origin, event)| match event {
                TransportEvent::Status(text) => Some((origin.connection, text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![(2, "fresh".to_string())]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_is_idempotent_and_stops_delivery() {
        let sink = Arc::new(RecordingSink::default());
        let transport = MockTransport::new();
        let mut slot = None;
        ListenerBundle::attach(&mut slot, transport.as_ref(), origin(1), Arc::downgrade(&sink));

        let mut bundle = slot.take().unwrap();
        bundle.detach();
        bundle.detach();
        assert!(!bundle.is_attached());

        transport.emit(TransportEvent::Status("ignored".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.events.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_forwarded_once_and_ends_task() {
        let sink = Arc::new(RecordingSink::default());
        let transport = MockTransport::new();
        let mut slot = None;
        ListenerBundle::attach(&mut slot, transport.as_ref(), origin(3), Arc::downgrade(&sink));
        transport.close("bye");
        sink.wait_for(1).await;
        transport.emit(TransportEvent::Status("after close".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sink.events.lock().clone(),
            vec![(
                origin(3),
                TransportEvent::Close {
                    reason: "bye".into()
                }
            )]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn overflow_reports_lag_and_stops_forwarding() {
        let sink = Arc::new(RecordingSink::default());
        let transport = MockTransport::new();
        let mut slot = None;
        ListenerBundle::attach(&mut slot, transport.as_ref(), origin(4), Arc::downgrade(&sink));

        for index in 0..300u64 {
            transport.emit(TransportEvent::Status(format!("burst {index}")));
        }
        while sink.lags.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.emit(TransportEvent::Status("after lag".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.lags.lock().clone(), vec![(origin(4), 44)]);
        assert!(sink.events.lock().is_empty());
    }
}
