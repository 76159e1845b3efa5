//! Federation with peer relays.
//!
//! Every configured peer gets a long-lived task that subscribes to recent
//! events on the peer, feeds them through the ingestion pipeline, and writes
//! locally published events back to the peer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    event::Event,
    ingest::{Origin, Relay},
    message::{self, RelayMessage},
};

const PUBLISH_BUFFER: usize = 1024;

/// Handle used to push locally published events to every connected peer.
#[derive(Clone)]
pub struct Federation {
    tx: broadcast::Sender<String>,
}

impl Default for Federation {
    fn default() -> Self {
        Self::new()
    }
}

impl Federation {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUBLISH_BUFFER);
        Self { tx }
    }

    /// Queue `["EVENT", raw]` for every live peer connection. Returns the
    /// number of peers that will see it.
    pub fn publish(&self, raw: &str) -> usize {
        self.tx.send(message::publish_frame(raw)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Settings shared by all peer tasks.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// SOCKS5 proxy address, e.g. a local Tor daemon.
    pub socks: Option<String>,
    /// How far back the initial subscription reaches.
    pub lookback: Duration,
    /// Delay before reconnecting after a failure or disconnect.
    pub retry: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            socks: None,
            lookback: Duration::from_secs(24 * 60 * 60),
            retry: Duration::from_secs(5),
        }
    }
}

/// Spawn one reconnecting task per peer URL.
pub fn spawn(relay: Relay, peers: &[String], opts: PeerOptions) -> Vec<JoinHandle<()>> {
    peers
        .iter()
        .map(|url| {
            let relay = relay.clone();
            let url = url.clone();
            let opts = opts.clone();
            tokio::spawn(async move { peer_loop(relay, url, opts).await })
        })
        .collect()
}

async fn peer_loop(relay: Relay, url: String, opts: PeerOptions) {
    let mut newest = None;
    loop {
        let since = since_for(newest, unix_now(), opts.lookback.as_secs());
        match sync_peer(&relay, &url, &opts, since, &mut newest).await {
            Ok(()) => info!(peer = %url, "peer closed connection"),
            Err(e) => warn!(peer = %url, error = %e, "peer connection failed"),
        }
        sleep(opts.retry).await;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lower bound for the peer subscription: the newest event already received
/// from that peer, but never older than the look-back window.
pub fn since_for(newest: Option<u64>, now: u64, lookback: u64) -> u64 {
    let floor = now.saturating_sub(lookback);
    newest.map_or(floor, |n| n.max(floor))
}

/// Subscription name used on a peer, stable per URL.
pub fn subscription_id(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("federation-{}", &hash[..8])
}

/// Run one connection to a peer until it closes or fails.
async fn sync_peer(
    relay: &Relay,
    url: &str,
    opts: &PeerOptions,
    since: u64,
    newest: &mut Option<u64>,
) -> Result<()> {
    let mut published = relay.federation().subscribe();
    let ws = connect_ws(url, opts.socks.as_deref()).await?;
    let (mut sink, mut stream) = ws.split();
    let sub = subscription_id(url);
    sink.send(Message::Text(message::req_frame(
        &sub,
        &[json!({ "since": since })],
    )))
    .await?;
    info!(peer = %url, subscription = %sub, since, "subscribed to peer");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(txt))) => handle_frame(relay, url, &txt, newest).await,
                Some(Ok(_)) => {}
            },
            outgoing = published.recv() => match outgoing {
                Ok(frame) => sink.send(Message::Text(frame)).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(peer = %url, skipped, "peer fell behind on published events");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn handle_frame(relay: &Relay, url: &str, txt: &str, newest: &mut Option<u64>) {
    match RelayMessage::decode(txt) {
        Ok(RelayMessage::Event { event, .. }) => {
            let ev = match Event::from_value(event) {
                Ok(ev) => ev,
                Err(e) => {
                    debug!(peer = %url, error = %e, "ignoring malformed peer event");
                    return;
                }
            };
            // Peers replay their backlog on every reconnect.
            match relay.is_stored(ev.id.clone()).await {
                Ok(true) => {
                    debug!(peer = %url, event = %ev.id, "already stored");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(peer = %url, error = %e, "could not check for stored event"),
            }
            let raw = match ev.to_raw() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(peer = %url, error = %e, "could not serialize peer event");
                    return;
                }
            };
            let created_at = ev.created_at;
            let outcome = relay.ingest(ev, raw, Origin::Federation).await;
            if outcome.is_accepted() {
                *newest = Some(newest.map_or(created_at, |n| n.max(created_at)));
            }
        }
        Ok(RelayMessage::Eose(sub)) => debug!(peer = %url, subscription = %sub, "peer backlog done"),
        Ok(RelayMessage::Notice(msg)) => info!(peer = %url, notice = %msg, "peer notice"),
        Ok(RelayMessage::Other) => {}
        Err(e) => debug!(peer = %url, error = %e, "ignoring undecodable peer frame"),
    }
}

/// Check that a peer accepts a WebSocket connection.
pub async fn test_connection(url: &str, socks: Option<&str>) -> Result<()> {
    let mut ws = connect_ws(url, socks).await?;
    ws.close(None).await.ok();
    Ok(())
}

type PeerStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
/// `wss://` peers get a TLS session on top of the TCP or SOCKS stream.
async fn connect_ws(peer: &str, socks: Option<&str>) -> Result<PeerStream> {
    let url = Url::parse(peer)?;
    if url.scheme() == "wss" {
        // Errors only if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = peer.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
