//! Shared, reference-counted connections keyed by [`SessionKey`].
//!
//! Every UI surface showing a session calls [`ConnectionRegistry::acquire`]
//! and holds the returned [`Subscription`]. The first acquire creates a
//! session entry and starts connecting; later ones join the same entry.
//! Releasing the last subscription arms a keep-alive timer so a quick remount
//! reuses the live transport instead of reconnecting.

pub mod entry;

pub use entry::{
    ConnectOutcome, ConnectionSnapshot, ConnectionStatus, EntryId, EntryStats, SnapshotSubscriber,
    TransportSummary,
};

use crate::config::RegistryConfig;
use crate::credentials::{CredentialApi, CredentialResolver};
use crate::grid::IngestOutcome;
use crate::listener::{EventOrigin, ListenerBundle, TransportEventSink};
use crate::protocol::TransportFrame;
use crate::session::{ConnectParams, SessionKey};
use crate::shared::SharedOperation;
use crate::transport::{ConnectRequest, Transport, TransportConnector, TransportEvent};
use entry::{SessionEntry, SubscriberId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct Arena {
    entries: HashMap<EntryId, SessionEntry>,
    index: HashMap<SessionKey, EntryId>,
    next_entry: u64,
    next_subscriber: SubscriberId,
}

impl Arena {
    fn remove(&mut self, id: EntryId) -> Option<SessionEntry> {
        let entry = self.entries.remove(&id)?;
        if self.index.get(&entry.key) == Some(&id) {
            self.index.remove(&entry.key);
        }
        Some(entry)
    }
}

struct RegistryInner {
    this: Weak<RegistryInner>,
    config: RegistryConfig,
    resolver: CredentialResolver,
    connector: Arc<dyn TransportConnector>,
    arena: Mutex<Arena>,
}

/// Owner of every live session connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        api: Arc<dyn CredentialApi>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| RegistryInner {
            this: this.clone(),
            config,
            resolver: CredentialResolver::new(api),
            connector,
            arena: Mutex::new(Arena::default()),
        });
        Self { inner }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Subscribe to the session identified by `key`.
    ///
    /// The subscriber receives the current snapshot before this returns, and
    /// every later one until the subscription is released. A connect attempt
    /// starts unless one is in flight or a transport is live; a pending
    /// backoff reconnect is cancelled in its favour. `params` replace those
    /// stored for the key.
    pub fn acquire<S: SnapshotSubscriber>(
        &self,
        key: SessionKey,
        params: ConnectParams,
        subscriber: S,
    ) -> Subscription {
        let subscriber: Arc<dyn SnapshotSubscriber> = Arc::new(subscriber);
        let (entry_id, subscriber_id, snapshot, connect) = {
            let mut arena = self.inner.arena.lock();
            let existing = arena.index.get(&key).copied();
            let id = match existing {
                Some(id) => id,
                None => {
                    arena.next_entry += 1;
                    let id = EntryId(arena.next_entry);
                    arena.index.insert(key.clone(), id);
                    info!(target = "connect::registry", key = %key, entry = %id, "session entry created");
                    id
                }
            };
            arena.next_subscriber += 1;
            let subscriber_id = arena.next_subscriber;
            let config = &self.inner.config;
            let entry = arena
                .entries
                .entry(id)
                .or_insert_with(|| SessionEntry::new(id, key.clone(), params.clone(), config));
            entry.params = params;
            if entry.cancel_keep_alive() {
                debug!(target = "connect::registry", key = %key, entry = %id, "keep-alive cancelled");
            }
            entry.subscribers.push((subscriber_id, subscriber.clone()));
            entry.ref_count += 1;
            let connect = if entry.connect_operation.is_none() && entry.transport.is_none() {
                entry.cancel_reconnect();
                Some(self.inner.begin_connect(entry))
            } else {
                None
            };
            trace!(
                target = "connect::registry",
                key = %key,
                entry = %id,
                ref_count = entry.ref_count,
                "acquired"
            );
            (id, subscriber_id, entry.snapshot(), connect)
        };

        subscriber.on_snapshot(&snapshot);
        if let Some(connect) = connect {
            connect.spawn_driver();
        }

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key,
            entry: entry_id,
            subscriber: subscriber_id,
            released: false,
        }
    }

    /// Tear down the entry for `key` immediately. Returns whether one existed.
    pub fn dispose(&self, key: &SessionKey, reason: &str) -> bool {
        let removed = {
            let mut arena = self.inner.arena.lock();
            let Some(id) = arena.index.get(key).copied() else {
                return false;
            };
            arena.remove(id).map(|mut entry| {
                entry.teardown(reason);
                entry
            })
        };
        match removed {
            Some(entry) => {
                info!(target = "connect::registry", key = %key, entry = %entry.id, reason, "session disposed");
                true
            }
            None => false,
        }
    }

    /// Drop the live transport and schedule a new connection.
    ///
    /// Returns false when no entry exists or a connect is already in flight.
    pub fn reconnect(&self, key: &SessionKey, immediate: bool) -> bool {
        let delivery = {
            let mut arena = self.inner.arena.lock();
            let Some(id) = arena.index.get(key).copied() else {
                return false;
            };
            let Some(entry) = arena.entries.get_mut(&id) else {
                return false;
            };
            if entry.connect_operation.is_some() {
                return false;
            }
            entry.drop_transport("reconnect requested");
            entry.status = ConnectionStatus::Reconnecting;
            self.inner.schedule_reconnect(entry, immediate);
            entry.delivery()
        };
        delivery.send();
        true
    }

    /// Returns whether follow-tail changed.
    pub fn set_follow_tail(&self, key: &SessionKey, follow: bool) -> bool {
        self.inner
            .update_by_key(key, |entry| entry.store_mut().set_follow_tail(follow))
            .unwrap_or(false)
    }

    /// Returns whether the viewport height changed.
    pub fn resize(&self, key: &SessionKey, rows: usize) -> bool {
        self.inner
            .update_by_key(key, |entry| entry.store_mut().apply_resize(rows))
            .unwrap_or(false)
    }

    pub fn scroll_lines(&self, key: &SessionKey, delta: isize) {
        self.inner.update_by_key(key, |entry| {
            entry.store_mut().scroll_lines(delta);
            true
        });
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<ConnectionSnapshot> {
        let mut arena = self.inner.arena.lock();
        let id = arena.index.get(key).copied()?;
        arena.entries.get_mut(&id).map(SessionEntry::snapshot)
    }

    pub fn inspect(&self, key: &SessionKey) -> Option<EntryStats> {
        let arena = self.inner.arena.lock();
        let id = arena.index.get(key)?;
        arena.entries.get(id).map(SessionEntry::stats)
    }

    pub fn len(&self) -> usize {
        self.inner.arena.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every entry.
    pub fn shutdown(&self) {
        let removed: Vec<SessionEntry> = {
            let mut arena = self.inner.arena.lock();
            arena.index.clear();
            arena
                .entries
                .drain()
                .map(|(_, mut entry)| {
                    entry.teardown("registry shutdown");
                    entry
                })
                .collect()
        };
        if !removed.is_empty() {
            info!(target = "connect::registry", entries = removed.len(), "registry shut down");
        }
    }
}

impl RegistryInner {
    fn weak(&self) -> Weak<RegistryInner> {
        self.this.clone()
    }

    fn begin_connect(&self, entry: &mut SessionEntry) -> SharedOperation<ConnectOutcome> {
        let operation = SharedOperation::new(run_connect(self.weak(), entry.id));
        entry.connect_operation = Some(operation.clone());
        entry.status = ConnectionStatus::Connecting;
        debug!(
            target = "connect::registry",
            key = %entry.key,
            entry = %entry.id,
            attempt = entry.reconnect_attempts,
            "connect started"
        );
        operation
    }

    /// Apply `update` to a live entry and publish when it reports a change.
    fn update<R>(
        &self,
        id: EntryId,
        update: impl FnOnce(&mut SessionEntry) -> (R, bool),
    ) -> Option<R> {
        let (result, delivery) = {
            let mut arena = self.arena.lock();
            let entry = arena.entries.get_mut(&id).filter(|entry| !entry.disposed)?;
            let (result, changed) = update(entry);
            (result, changed.then(|| entry.delivery()))
        };
        if let Some(delivery) = delivery {
            delivery.send();
        }
        Some(result)
    }

    fn update_by_key(
        &self,
        key: &SessionKey,
        update: impl FnOnce(&mut SessionEntry) -> bool,
    ) -> Option<bool> {
        let id = self.arena.lock().index.get(key).copied()?;
        self.update(id, |entry| {
            let changed = update(entry);
            (changed, changed)
        })
    }

    fn schedule_reconnect(&self, entry: &mut SessionEntry, immediate: bool) {
        entry.cancel_reconnect();
        let delay = if immediate {
            Duration::ZERO
        } else {
            self.config.backoff.delay(entry.reconnect_attempts)
        };
        entry.reconnect_attempts = entry.reconnect_attempts.saturating_add(1);
        info!(
            target = "connect::registry",
            key = %entry.key,
            entry = %entry.id,
            attempt = entry.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        let weak = self.weak();
        let id = entry.id;
        let deadline = Instant::now() + delay;
        entry.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_due(id);
            }
        }));
    }

    fn reconnect_due(&self, id: EntryId) {
        let started = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&id).filter(|entry| !entry.disposed) else {
                return;
            };
            entry.reconnect_timer = None;
            if entry.connect_operation.is_some() || entry.transport.is_some() {
                return;
            }
            let operation = self.begin_connect(entry);
            (operation, entry.delivery())
        };
        let (operation, delivery) = started;
        delivery.send();
        operation.spawn_driver();
    }

    fn install_transport(&self, id: EntryId, transport: Arc<dyn Transport>) -> ConnectOutcome {
        let delivery = {
            let mut arena = self.arena.lock();
            match arena.entries.get_mut(&id).filter(|entry| !entry.disposed) {
                Some(entry) => {
                    let connection = entry.install_transport(transport.clone());
                    ListenerBundle::attach(
                        &mut entry.listener,
                        transport.as_ref(),
                        EventOrigin { entry: id, connection },
                        self.weak(),
                    );
                    info!(
                        target = "connect::registry",
                        key = %entry.key,
                        entry = %id,
                        transport = %transport.id(),
                        kind = %transport.kind(),
                        "connected"
                    );
                    Some(entry.delivery())
                }
                None => None,
            }
        };
        match delivery {
            Some(delivery) => {
                delivery.send();
                ConnectOutcome::Connected
            }
            None => {
                debug!(target = "connect::registry", entry = %id, "entry gone before connect finished");
                transport.close("session disposed");
                ConnectOutcome::Cancelled
            }
        }
    }

    fn connect_failed(&self, id: EntryId, message: String) -> ConnectOutcome {
        let delivery = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&id).filter(|entry| !entry.disposed) else {
                return ConnectOutcome::Cancelled;
            };
            warn!(
                target = "connect::registry",
                key = %entry.key,
                entry = %id,
                attempt = entry.reconnect_attempts,
                error = %message,
                "connect failed"
            );
            entry.status = ConnectionStatus::Error;
            entry.error = Some(message.clone());
            entry.connect_operation = None;
            self.schedule_reconnect(entry, false);
            entry.delivery()
        };
        delivery.send();
        ConnectOutcome::Failed(message)
    }

    fn is_live(&self, id: EntryId) -> bool {
        self.arena
            .lock()
            .entries
            .get(&id)
            .is_some_and(|entry| !entry.disposed)
    }

    /// Called when the transport went away underneath a connected entry.
    fn transport_lost(&self, entry: &mut SessionEntry, reason: String) {
        info!(
            target = "connect::registry",
            key = %entry.key,
            entry = %entry.id,
            reason = %reason,
            "transport closed"
        );
        entry.drop_transport(&reason);
        entry.status = ConnectionStatus::Reconnecting;
        entry.last_close_reason = Some(reason);
        self.schedule_reconnect(entry, false);
    }

    fn release(&self, id: EntryId, subscriber: SubscriberId) {
        let (removed, delivery) = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&id).filter(|entry| !entry.disposed) else {
                return;
            };
            let Some(position) = entry
                .subscribers
                .iter()
                .position(|(candidate, _)| *candidate == subscriber)
            else {
                return;
            };
            let removed = entry.subscribers.remove(position);
            entry.ref_count = entry.ref_count.saturating_sub(1);
            trace!(
                target = "connect::registry",
                key = %entry.key,
                entry = %id,
                ref_count = entry.ref_count,
                "released"
            );
            if entry.ref_count == 0 {
                entry.cancel_keep_alive();
                let keep_alive = self.config.keep_alive;
                let weak = self.weak();
                let deadline = Instant::now() + keep_alive;
                entry.keep_alive_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.reap(id);
                    }
                }));
                debug!(
                    target = "connect::registry",
                    key = %entry.key,
                    entry = %id,
                    keep_alive_ms = keep_alive.as_millis() as u64,
                    "keep-alive armed"
                );
            }
            (removed, entry.delivery())
        };
        delivery.send();
        drop(removed);
    }

    fn reap(&self, id: EntryId) {
        let removed = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&id) else {
                return;
            };
            if entry.ref_count > 0 {
                entry.keep_alive_timer = None;
                return;
            }
            arena.remove(id).map(|mut entry| {
                entry.keep_alive_timer = None;
                entry.teardown("keep-alive expired");
                entry
            })
        };
        if let Some(entry) = removed {
            info!(target = "connect::registry", key = %entry.key, entry = %id, "session reaped");
        }
    }

    fn current_operation(&self, id: EntryId) -> Option<SharedOperation<ConnectOutcome>> {
        self.arena
            .lock()
            .entries
            .get(&id)
            .and_then(|entry| entry.connect_operation.clone())
    }
}

impl TransportEventSink for RegistryInner {
    fn handle_event(&self, origin: EventOrigin, event: TransportEvent) {
        let delivery = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&origin.entry) else {
                return;
            };
            if !entry.accepts(origin) {
                trace!(
                    target = "connect::listener",
                    entry = %origin.entry,
                    connection = origin.connection,
                    "ignoring event from stale transport"
                );
                return;
            }
            let changed = match event {
                TransportEvent::Open => {
                    let changed = entry.status != ConnectionStatus::Connected;
                    entry.status = ConnectionStatus::Connected;
                    changed
                }
                TransportEvent::Secure { summary } => {
                    entry.secure_summary = Some(summary);
                    true
                }
                TransportEvent::Frame(TransportFrame::Heartbeat { timestamp_ms, .. }) => {
                    let now = now_ms();
                    entry.latency_ms = Some(now.saturating_sub(timestamp_ms).max(0) as u64);
                    entry.last_heartbeat_ms = Some(now);
                    true
                }
                TransportEvent::Frame(TransportFrame::Row(row)) => {
                    entry.store_mut().ingest(row.row, row.seq, &row.text)
                        == IngestOutcome::Written
                }
                TransportEvent::Frame(TransportFrame::Rows { rows }) => {
                    let store = entry.store_mut();
                    rows.iter().fold(false, |written, row| {
                        let outcome = store.ingest(row.row, row.seq, &row.text);
                        written | (outcome == IngestOutcome::Written)
                    })
                }
                TransportEvent::Frame(TransportFrame::Shutdown) => {
                    self.transport_lost(entry, "host shut down".to_string());
                    true
                }
                TransportEvent::Close { reason } => {
                    self.transport_lost(entry, reason);
                    true
                }
                TransportEvent::Error { message } | TransportEvent::SignalingError { message } => {
                    warn!(
                        target = "connect::listener",
                        key = %entry.key,
                        entry = %origin.entry,
                        error = %message,
                        "transport error"
                    );
                    entry.error = Some(message);
                    true
                }
                TransportEvent::Status(status) => {
                    debug!(target = "connect::listener", key = %entry.key, %status, "transport status");
                    false
                }
                TransportEvent::SignalingClosed => {
                    debug!(target = "connect::listener", key = %entry.key, "signaling closed");
                    false
                }
            };
            if !changed {
                return;
            }
            entry.delivery()
        };
        delivery.send();
    }

    fn handle_lag(&self, origin: EventOrigin, skipped: u64) {
        let delivery = {
            let mut arena = self.arena.lock();
            let Some(entry) = arena.entries.get_mut(&origin.entry) else {
                return;
            };
            if !entry.accepts(origin) {
                return;
            }
            let reason = format!("listener lagged by {skipped} events");
            warn!(
                target = "connect::listener",
                key = %entry.key,
                entry = %origin.entry,
                skipped,
                "transport events lost, resynchronizing"
            );
            entry.drop_transport(&reason);
            entry.status = ConnectionStatus::Reconnecting;
            entry.last_close_reason = Some(reason);
            self.schedule_reconnect(entry, true);
            entry.delivery()
        };
        delivery.send();
    }
}

async fn run_connect(weak: Weak<RegistryInner>, id: EntryId) -> ConnectOutcome {
    let Some(inner) = weak.upgrade() else {
        return ConnectOutcome::Cancelled;
    };
    let prepared = {
        let arena = inner.arena.lock();
        arena
            .entries
            .get(&id)
            .filter(|entry| !entry.disposed)
            .map(|entry| (entry.params.clone(), entry.attach_gate.clone()))
    };
    let Some((params, gate)) = prepared else {
        return ConnectOutcome::Cancelled;
    };
    let resolver = inner.resolver.clone();
    let connector = inner.connector.clone();
    drop(inner);

    let credentials = match resolver.resolve(&params, &gate).await {
        Ok(credentials) => credentials,
        Err(err) => {
            return match weak.upgrade() {
                Some(inner) => inner.connect_failed(id, err.to_string()),
                None => ConnectOutcome::Cancelled,
            };
        }
    };

    if !weak.upgrade().is_some_and(|inner| inner.is_live(id)) {
        return ConnectOutcome::Cancelled;
    }

    let request = ConnectRequest {
        scope: params.scope.clone(),
        session_id: params.session_id.clone(),
        credentials,
        label: params.label.clone(),
    };
    let result = connector.connect(request).await;
    let Some(inner) = weak.upgrade() else {
        if let Ok(transport) = result {
            transport.close("registry dropped");
        }
        return ConnectOutcome::Cancelled;
    };
    match result {
        Ok(transport) => inner.install_transport(id, transport),
        Err(err) => inner.connect_failed(id, err.to_string()),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// A consumer's claim on a session connection. Releases on drop.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    key: SessionKey,
    entry: EntryId,
    subscriber: SubscriberId,
    released: bool,
}

impl Subscription {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry
    }

    /// Wait for the connect attempt in flight, if there is one.
    pub async fn ready(&self) -> Option<ConnectOutcome> {
        let operation = self.registry.upgrade()?.current_operation(self.entry)?;
        Some(operation.wait().await)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.release(self.entry, self.subscriber);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("entry", &self.entry)
            .field("released", &self.released)
            .finish()
    }
}
