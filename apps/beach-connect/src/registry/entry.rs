use crate::config::RegistryConfig;
use crate::credentials::AttachGate;
use crate::grid::{GridSnapshot, GridStore};
use crate::listener::{EventOrigin, ListenerBundle};
use crate::session::{ConnectParams, SessionKey};
use crate::shared::SharedOperation;
use crate::transport::{Transport, TransportId, TransportKind};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// How a connect attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(String),
    /// The entry was disposed while the attempt was in flight.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSummary {
    pub id: TransportId,
    pub kind: TransportKind,
}

/// Immutable state broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub key: SessionKey,
    pub status: ConnectionStatus,
    pub connecting: bool,
    pub error: Option<String>,
    pub secure_summary: Option<String>,
    pub latency_ms: Option<u64>,
    pub transport: Option<TransportSummary>,
    pub grid: Arc<GridSnapshot>,
    pub ref_count: usize,
    pub reconnect_attempts: u32,
    pub last_close_reason: Option<String>,
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} refs={} rows={}",
            self.key,
            self.status,
            self.ref_count,
            self.grid.loaded_count()
        )?;
        if let Some(transport) = &self.transport {
            write!(f, " via {} {}", transport.kind, transport.id)?;
        }
        if let Some(latency) = self.latency_ms {
            write!(f, " latency={latency}ms")?;
        }
        if self.reconnect_attempts > 0 {
            write!(f, " attempts={}", self.reconnect_attempts)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error=\"{error}\"")?;
        }
        Ok(())
    }
}

/// Receives every snapshot of a session it subscribed to.
pub trait SnapshotSubscriber: Send + Sync + 'static {
    fn on_snapshot(&self, snapshot: &ConnectionSnapshot);
}

impl<F> SnapshotSubscriber for F
where
    F: Fn(&ConnectionSnapshot) + Send + Sync + 'static,
{
    fn on_snapshot(&self, snapshot: &ConnectionSnapshot) {
        self(snapshot)
    }
}

/// Diagnostic view of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub id: EntryId,
    pub status: ConnectionStatus,
    pub ref_count: usize,
    pub subscribers: usize,
    pub keep_alive_armed: bool,
    pub connect_in_flight: bool,
    pub reconnect_scheduled: bool,
    pub reconnect_attempts: u32,
    pub connection_seq: u64,
    pub transport: Option<TransportId>,
}

/// A snapshot paired with everyone who should see it.
pub(crate) struct Delivery {
    snapshot: ConnectionSnapshot,
    subscribers: Vec<Arc<dyn SnapshotSubscriber>>,
}

impl Delivery {
    pub(crate) fn send(self) {
        for subscriber in &self.subscribers {
            subscriber.on_snapshot(&self.snapshot);
        }
    }
}

pub(crate) type SubscriberId = u64;

pub(crate) struct SessionEntry {
    pub id: EntryId,
    pub key: SessionKey,
    pub params: ConnectParams,
    pub store: GridStore,
    grid_cache: Option<Arc<GridSnapshot>>,
    pub transport: Option<Arc<dyn Transport>>,
    /// Bumped for every installed transport; events from older ones are stale.
    pub connection_seq: u64,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub secure_summary: Option<String>,
    pub latency_ms: Option<u64>,
    pub last_heartbeat_ms: Option<i64>,
    pub subscribers: Vec<(SubscriberId, Arc<dyn SnapshotSubscriber>)>,
    pub ref_count: usize,
    pub keep_alive_timer: Option<JoinHandle<()>>,
    pub connect_operation: Option<SharedOperation<ConnectOutcome>>,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub listener: Option<ListenerBundle>,
    pub disposed: bool,
    pub reconnect_attempts: u32,
    pub last_close_reason: Option<String>,
    pub attach_gate: AttachGate,
}

impl SessionEntry {
    pub fn new(id: EntryId, key: SessionKey, params: ConnectParams, config: &RegistryConfig) -> Self {
        Self {
            id,
            key,
            params,
            store: GridStore::new(config.viewport_rows, config.history_rows),
            grid_cache: None,
            transport: None,
            connection_seq: 0,
            status: ConnectionStatus::Idle,
            error: None,
            secure_summary: None,
            latency_ms: None,
            last_heartbeat_ms: None,
            subscribers: Vec::new(),
            ref_count: 0,
            keep_alive_timer: None,
            connect_operation: None,
            reconnect_timer: None,
            listener: None,
            disposed: false,
            reconnect_attempts: 0,
            last_close_reason: None,
            attach_gate: AttachGate::new(),
        }
    }

    /// Mutable access to the grid; invalidates the cached grid snapshot.
    pub fn store_mut(&mut self) -> &mut GridStore {
        self.grid_cache = None;
        &mut self.store
    }

    pub fn snapshot(&mut self) -> ConnectionSnapshot {
        let grid = match &self.grid_cache {
            Some(grid) => grid.clone(),
            None => {
                let grid = Arc::new(self.store.snapshot());
                self.grid_cache = Some(grid.clone());
                grid
            }
        };
        ConnectionSnapshot {
            key: self.key.clone(),
            status: self.status,
            connecting: self.connect_operation.is_some()
                || matches!(
                    self.status,
                    ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
                ),
            error: self.error.clone(),
            secure_summary: self.secure_summary.clone(),
            latency_ms: self.latency_ms,
            transport: self.transport.as_ref().map(|transport| TransportSummary {
                id: transport.id(),
                kind: transport.kind(),
            }),
            grid,
            ref_count: self.ref_count,
            reconnect_attempts: self.reconnect_attempts,
            last_close_reason: self.last_close_reason.clone(),
        }
    }

    pub fn delivery(&mut self) -> Delivery {
        Delivery {
            snapshot: self.snapshot(),
            subscribers: self
                .subscribers
                .iter()
                .map(|(_, subscriber)| subscriber.clone())
                .collect(),
        }
    }

    pub fn stats(&self) -> EntryStats {
        EntryStats {
            id: self.id,
            status: self.status,
            ref_count: self.ref_count,
            subscribers: self.subscribers.len(),
            keep_alive_armed: self.keep_alive_timer.is_some(),
            connect_in_flight: self.connect_operation.is_some(),
            reconnect_scheduled: self.reconnect_timer.is_some(),
            reconnect_attempts: self.reconnect_attempts,
            connection_seq: self.connection_seq,
            transport: self.transport.as_ref().map(|transport| transport.id()),
        }
    }

    /// Whether an event from `origin` belongs to the live transport.
    pub fn accepts(&self, origin: EventOrigin) -> bool {
        !self.disposed && self.connection_seq == origin.connection && self.transport.is_some()
    }

    /// Returns whether a timer was armed.
    pub fn cancel_keep_alive(&mut self) -> bool {
        match self.keep_alive_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// Stop listening to and close the live transport, if any.
    pub fn drop_transport(&mut self, reason: &str) {
        if let Some(listener) = self.listener.as_mut() {
            listener.detach();
        }
        self.listener = None;
        if let Some(transport) = self.transport.take() {
            transport.close(reason);
        }
    }

    /// Adopt a freshly negotiated transport and return its connection sequence.
    ///
    /// The grid is reset so rows from the previous connection never mix with
    /// the new stream.
    pub fn install_transport(&mut self, transport: Arc<dyn Transport>) -> u64 {
        self.drop_transport("replaced by new connection");
        let decision = self.store_mut().reset();
        self.transport = Some(transport);
        self.connection_seq += 1;
        self.status = ConnectionStatus::Connected;
        self.error = None;
        self.latency_ms = None;
        self.secure_summary = None;
        self.reconnect_attempts = 0;
        self.connect_operation = None;
        debug!(
            target = "connect::registry",
            key = %self.key,
            entry = %self.id,
            connection = self.connection_seq,
            follow_tail = decision.enable,
            reason = decision.reason,
            "transport installed"
        );
        self.connection_seq
    }

    /// Release every resource; the entry must not be used afterwards.
    pub fn teardown(&mut self, reason: &str) {
        self.disposed = true;
        self.cancel_keep_alive();
        self.cancel_reconnect();
        self.connect_operation = None;
        self.drop_transport(reason);
    }
}
