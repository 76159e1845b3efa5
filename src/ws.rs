//! Client WebSocket sessions speaking NIP-01.
//!
//! Each session registers with the subscription registry, runs a writer task
//! that drains the connection's outbound queue into the socket, and handles
//! inbound frames one at a time.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    event::Event,
    filter::Filter,
    ingest::{IngestOutcome, Origin, Relay},
    message::{self, ClientMessage},
    registry::ConnectionId,
};

/// Drive one client connection until it closes.
pub async fn session(socket: WebSocket, relay: Relay, queue: usize) {
    let (tx, mut rx) = mpsc::channel::<String>(queue);
    let conn = relay.registry().connect(tx.clone());
    info!(conn, "client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        sink.close().await.ok();
    });

    let session = Session {
        relay: relay.clone(),
        conn,
        tx,
    };
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(txt)) => {
                if !session.handle_text(&txt).await {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "client socket error");
                break;
            }
        }
    }

    let subscriptions = relay.registry().drop_connection(conn);
    drop(session);
    writer.await.ok();
    info!(conn, subscriptions, "client disconnected");
}

struct Session {
    relay: Relay,
    conn: ConnectionId,
    tx: mpsc::Sender<String>,
}

impl Session {
    /// Handle one text frame. Returns `false` once the writer is gone.
    async fn handle_text(&self, txt: &str) -> bool {
        match ClientMessage::decode(txt) {
            Ok(ClientMessage::Req { name, filters }) => self.subscribe(&name, &filters).await,
            Ok(ClientMessage::Event(value)) => self.publish(value).await,
            Ok(ClientMessage::Close(name)) => {
                let existed = self.relay.registry().unregister(self.conn, &name);
                debug!(conn = self.conn, subscription = %name, existed, "subscription closed");
                true
            }
            Ok(ClientMessage::Unknown(cmd)) => self.notice(&format!("could not handle {cmd}")).await,
            Err(e) => self.notice(&e.to_string()).await,
        }
    }

    async fn send(&self, frame: String) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    async fn notice(&self, msg: &str) -> bool {
        self.send(message::notice_frame(msg)).await
    }

    async fn subscribe(&self, name: &str, raw_filters: &[Value]) -> bool {
        let mut filters = Vec::with_capacity(raw_filters.len());
        for (index, value) in raw_filters.iter().enumerate() {
            match Filter::from_value(value) {
                Ok(f) => filters.push(f),
                Err(e) => {
                    let msg = format!("invalid filter {index} on subscription {name}: {e}");
                    if !self.notice(&msg).await {
                        return false;
                    }
                }
            }
        }

        if filters.is_empty() {
            self.relay.registry().unregister(self.conn, name);
        } else {
            let compiled = filters.iter().map(Filter::compile).collect();
            self.relay.registry().register_replaying(self.conn, name, compiled);
            debug!(conn = self.conn, subscription = %name, filters = filters.len(), "subscription registered");
            let replayed = match self.relay.query(filters).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(conn = self.conn, subscription = %name, error = %e, "historical query failed");
                    if !self.notice(&format!("could not query stored events: {e}")).await {
                        return false;
                    }
                    Vec::new()
                }
            };
            for raw in &replayed {
                if !self.send(message::event_frame(name, raw)).await {
                    return false;
                }
            }
            let held = self.relay.go_live(self.conn, name.to_string()).await;
            let seen: HashSet<&String> = replayed.iter().collect();
            for raw in held.iter().filter(|raw| !seen.contains(raw)) {
                if !self.send(message::event_frame(name, raw)).await {
                    return false;
                }
            }
        }
        self.send(message::eose_frame(name)).await
    }

    async fn publish(&self, value: Value) -> bool {
        let ev = match Event::from_value(value) {
            Ok(ev) => ev,
            Err(e) => return self.notice(&format!("invalid event: {e}")).await,
        };
        let raw = match ev.to_raw() {
            Ok(raw) => raw,
            Err(e) => return self.notice(&format!("invalid event: {e}")).await,
        };
        match self.relay.ingest(ev, raw, Origin::Client(self.conn)).await {
            IngestOutcome::Rejected(reason) => self.notice(&format!("event rejected: {reason}")).await,
            _ => true,
        }
    }
}
