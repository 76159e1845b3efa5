//! Live subscription registry and fan-out of accepted events.
//!
//! Each connection owns a bounded outbound queue and a map of subscription
//! name to compiled filters. The registry lock is only held for in-memory
//! matching; frames are handed to queues with `try_send` so a slow reader can
//! never stall ingestion.
//!
//! A subscription registered with [`Registry::register_replaying`] holds its
//! live frames back until [`Registry::finish_replay`], so the session can send
//! stored events first and drop live copies of events it already replayed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{
    event::Event,
    filter::{CompiledFilter, Fingerprint},
    message,
};

/// Numeric id assigned to every accepted connection.
pub type ConnectionId = u64;

/// Outbound text frames for one connection.
pub type Outbound = mpsc::Sender<String>;

struct ConnectionEntry {
    sender: Outbound,
    subscriptions: HashMap<String, Subscription>,
}

struct Subscription {
    filters: Vec<CompiledFilter>,
    /// Raw events matched while stored events are still being replayed.
    held: Option<Mutex<Vec<String>>>,
}

/// Snapshot used by the periodic diagnostics reporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    pub connections: usize,
    pub subscriptions: usize,
    /// Most common filters as `(json, count)`, most frequent first.
    pub top_filters: Vec<(String, usize)>,
}

#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new connection and return its id.
    pub fn connect(&self, sender: Outbound) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.write().insert(
            id,
            ConnectionEntry {
                sender,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    /// Register `filters` under `name`, replacing any previous filters for
    /// that name. Returns `false` if the connection is gone.
    pub fn register(&self, conn: ConnectionId, name: &str, filters: Vec<CompiledFilter>) -> bool {
        self.insert_subscription(conn, name, Subscription { filters, held: None })
    }

    /// Like [`Registry::register`], but matching events are held back until
    /// [`Registry::finish_replay`] instead of being queued.
    pub fn register_replaying(&self, conn: ConnectionId, name: &str, filters: Vec<CompiledFilter>) -> bool {
        let held = Some(Mutex::new(Vec::new()));
        self.insert_subscription(conn, name, Subscription { filters, held })
    }

    fn insert_subscription(&self, conn: ConnectionId, name: &str, sub: Subscription) -> bool {
        match self.write().get_mut(&conn) {
            Some(entry) => {
                entry.subscriptions.insert(name.to_string(), sub);
                true
            }
            None => false,
        }
    }

    /// Switch a replaying subscription to live delivery and return the raw
    /// events held back in the meantime, oldest first.
    pub fn finish_replay(&self, conn: ConnectionId, name: &str) -> Vec<String> {
        self.write()
            .get_mut(&conn)
            .and_then(|entry| entry.subscriptions.get_mut(name))
            .and_then(|sub| sub.held.take())
            .map(|held| held.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default()
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unregister(&self, conn: ConnectionId, name: &str) -> bool {
        self.write()
            .get_mut(&conn)
            .is_some_and(|entry| entry.subscriptions.remove(name).is_some())
    }

    /// Forget a connection and every subscription it held.
    pub fn drop_connection(&self, conn: ConnectionId) -> usize {
        self.write()
            .remove(&conn)
            .map_or(0, |entry| entry.subscriptions.len())
    }

    /// Every `(connection, subscription)` whose filters match `ev`.
    pub fn for_each_matching(&self, ev: &Event) -> Vec<(ConnectionId, String)> {
        let fp = Fingerprint::of(ev);
        let conns = self.read();
        matching(&conns, ev, &fp, None)
            .map(|(id, name, _, _)| (id, name.to_string()))
            .collect()
    }

    /// Queue `["EVENT", name, raw]` for every matching subscription except
    /// those owned by `exclude`. Returns the number of frames queued.
    pub fn fan_out(&self, ev: &Event, raw: &str, exclude: Option<ConnectionId>) -> usize {
        let fp = Fingerprint::of(ev);
        let conns = self.read();
        let mut queued = 0;
        for (id, name, sub, sender) in matching(&conns, ev, &fp, exclude) {
            if let Some(held) = &sub.held {
                let mut held = held.lock().unwrap_or_else(PoisonError::into_inner);
                if held.len() < sender.max_capacity() {
                    held.push(raw.to_string());
                    queued += 1;
                } else {
                    warn!(conn = id, subscription = %name, event = %ev.id, "replay backlog full, dropping event");
                }
                continue;
            }
            match sender.try_send(message::event_frame(name, raw)) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn = id, subscription = %name, event = %ev.id, "outbound queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = id, "outbound queue closed");
                }
            }
        }
        queued
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.read().values().map(|e| e.subscriptions.len()).sum()
    }

    pub fn stats(&self) -> RegistryStats {
        let conns = self.read();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut subscriptions = 0;
        for entry in conns.values() {
            subscriptions += entry.subscriptions.len();
            for filter in entry.subscriptions.values().flat_map(|sub| &sub.filters) {
                *counts.entry(filter.filter().to_value().to_string()).or_default() += 1;
            }
        }
        let mut top_filters: Vec<_> = counts.into_iter().collect();
        top_filters.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_filters.truncate(5);
        RegistryStats {
            connections: conns.len(),
            subscriptions,
            top_filters,
        }
    }
}

/// Matching subscriptions with their connection's queue. The pre-check runs
/// before the exact comparison for every filter.
fn matching<'a>(
    conns: &'a HashMap<ConnectionId, ConnectionEntry>,
    ev: &'a Event,
    fp: &'a Fingerprint,
    exclude: Option<ConnectionId>,
) -> impl Iterator<Item = (ConnectionId, &'a str, &'a Subscription, &'a Outbound)> + 'a {
    conns
        .iter()
        .filter(move |(id, _)| Some(**id) != exclude)
        .flat_map(move |(id, entry)| {
            entry
                .subscriptions
                .iter()
                .filter(move |(_, sub)| sub.filters.iter().any(|f| f.matches_fingerprinted(ev, fp)))
                .map(move |(name, sub)| (*id, name.as_str(), sub, &entry.sender))
        })
}
