//! Ingestion pipeline shared by client connections, federation peers, and the
//! CLI importer.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::{
    error::{StorageError, StorageResult},
    event::Event,
    federation::Federation,
    filter::Filter,
    registry::{ConnectionId, Registry},
    storage::{InsertOutcome, Store},
};

/// Default number of events returned per filter when the client sets no limit.
pub const DEFAULT_QUERY_LIMIT: usize = 500;

/// Where an event entered the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Published by a connected client; forwarded to federation peers and
    /// never echoed back to the publishing connection.
    Client(ConnectionId),
    /// Received from a federation peer; never forwarded to peers again.
    Federation,
    /// Imported from disk by the CLI.
    Local,
}

impl Origin {
    fn connection(self) -> Option<ConnectionId> {
        match self {
            Origin::Client(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Duplicate,
    /// Delivered to live subscribers only.
    Ephemeral,
    Rejected(String),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Stored | IngestOutcome::Ephemeral)
    }
}

/// Shared relay state: store, live subscriptions, and the federation handle.
#[derive(Clone)]
pub struct Relay {
    store: Store,
    registry: Arc<Registry>,
    federation: Federation,
    query_limit: usize,
    /// Held shared from commit to fan-out of a stored event, and exclusively
    /// when a subscription switches from replay to live delivery.
    pub(crate) gate: Arc<RwLock<()>>,
}

impl Relay {
    pub fn new(store: Store, federation: Federation) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::new()),
            federation,
            query_limit: DEFAULT_QUERY_LIMIT,
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn with_query_limit(mut self, query_limit: usize) -> Self {
        self.query_limit = query_limit;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn federation(&self) -> &Federation {
        &self.federation
    }

    /// Verify, persist, and distribute one event.
    pub async fn ingest(&self, ev: Event, raw: String, origin: Origin) -> IngestOutcome {
        if let Err(e) = ev.verify() {
            warn!(event = %ev.id, ?origin, error = %e, "rejected event");
            return IngestOutcome::Rejected(e.to_string());
        }
        if matches!(origin, Origin::Client(_)) {
            let peers = self.federation.publish(&raw);
            debug!(event = %ev.id, peers, "published to federation");
        }
        let exclude = origin.connection();
        if ev.is_ephemeral() {
            let delivered = self.registry.fan_out(&ev, &raw, exclude);
            debug!(event = %ev.id, delivered, "ephemeral event delivered");
            return IngestOutcome::Ephemeral;
        }

        let store = self.store.clone();
        let registry = self.registry.clone();
        let gate = self.gate.clone();
        let stored = tokio::task::spawn_blocking(move || -> StorageResult<_> {
            let _gate = gate.read().unwrap_or_else(PoisonError::into_inner);
            let outcome = store.insert(&ev, &raw)?;
            let delivered = match outcome {
                InsertOutcome::Inserted => registry.fan_out(&ev, &raw, exclude),
                InsertOutcome::Duplicate => 0,
            };
            Ok((outcome, delivered, ev))
        })
        .await
        .map_err(StorageError::from)
        .and_then(|res| res);
        match stored {
            Ok((InsertOutcome::Inserted, delivered, ev)) => {
                debug!(event = %ev.id, kind = ev.kind, delivered, "stored event");
                IngestOutcome::Stored
            }
            Ok((InsertOutcome::Duplicate, _, ev)) => {
                debug!(event = %ev.id, "duplicate event");
                IngestOutcome::Duplicate
            }
            Err(e) => {
                error!(error = %e, "failed to store event");
                IngestOutcome::Rejected(e.to_string())
            }
        }
    }

    /// End the replay phase of subscription `name` and return the live events
    /// held back during it. Waits for in-flight stored events to finish their
    /// fan-out, so every event committed before the switch is either in the
    /// returned list or was visible to the replay query.
    pub async fn go_live(&self, conn: ConnectionId, name: String) -> Vec<String> {
        let registry = self.registry.clone();
        let gate = self.gate.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = gate.write().unwrap_or_else(PoisonError::into_inner);
            registry.finish_replay(conn, &name)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(conn, error = %e, "replay switch task failed");
            Vec::new()
        })
    }

    /// Whether an event with `id` is already stored.
    pub async fn is_stored(&self, id: String) -> StorageResult<bool> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.exists(&id)).await?
    }

    /// Run a historical query on the reader connection.
    pub async fn query(&self, filters: Vec<Filter>) -> StorageResult<Vec<String>> {
        let store = self.store.clone();
        let limit = self.query_limit;
        tokio::task::spawn_blocking(move || store.query(&filters, limit)).await?
    }

    /// Log a one-line summary of connections, subscriptions, and storage.
    pub async fn report_stats(&self) {
        let stats = self.registry.stats();
        let store = self.store.clone();
        let counts = tokio::task::spawn_blocking(move || -> StorageResult<(u64, u64)> {
            Ok((store.count()?, store.visible_count()?))
        })
        .await
        .map_err(StorageError::from)
        .and_then(|res| res);
        match counts {
            Ok((events, visible)) => info!(
                connections = stats.connections,
                subscriptions = stats.subscriptions,
                events,
                visible,
                top_filters = ?stats.top_filters,
                "relay stats"
            ),
            Err(e) => warn!(error = %e, "could not collect relay stats"),
        }
    }
}
