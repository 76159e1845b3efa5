//! HTTP surface: WebSocket upgrade, relay information document, health
//! check, and an NDJSON query endpoint, all on one listener.

use std::{collections::BTreeMap, future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{config::RelayInfo, filter::Filter, ingest::Relay, ws};

/// NIPs advertised in the information document.
pub const SUPPORTED_NIPS: [u32; 7] = [1, 2, 9, 11, 12, 15, 16];

const NOSTR_JSON: &str = "application/nostr+json";

/// Largest inbound WebSocket message accepted by default.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    relay: Relay,
    info: RelayInfo,
    outbound_queue: usize,
    max_message_bytes: usize,
}

impl AppState {
    pub fn new(relay: Relay, info: RelayInfo, outbound_queue: usize) -> Self {
        Self {
            relay,
            info,
            outbound_queue,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Close connections that send a message larger than `bytes`.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .with_state(state)
}

/// Serve the relay on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "relay listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct InfoDocument {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<String>,
    supported_nips: Vec<u32>,
    software: String,
    version: String,
}

/// `/` serves WebSocket sessions, the information document for
/// `Accept: application/nostr+json`, and a landing page otherwise.
async fn root(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Some(upgrade) = ws {
        let relay = state.relay.clone();
        let queue = state.outbound_queue;
        return upgrade
            .max_message_size(state.max_message_bytes)
            .max_frame_size(state.max_message_bytes)
            .on_upgrade(move |socket| ws::session(socket, relay, queue));
    }
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(NOSTR_JSON));
    if wants_info {
        debug!("GET / (relay info)");
        let doc = InfoDocument {
            name: state.info.name.clone(),
            description: state.info.description.clone(),
            pubkey: state.info.pubkey.clone(),
            contact: state.info.contact.clone(),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        };
        return (
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CONTENT_TYPE, NOSTR_JSON),
            ],
            Json(doc),
        )
            .into_response();
    }
    Html(format!(
        "<!doctype html><title>{name}</title><h1>{name}</h1><p>This is a Nostr relay. Connect with a Nostr client over WebSocket.</p>",
        name = html_escape(&state.info.name)
    ))
    .into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// URL query parameters accepted by the `/query` endpoint.
#[derive(Deserialize, Default)]
struct QueryParams {
    /// Comma-separated event ids.
    ids: Option<String>,
    /// Comma-separated hex public keys.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `1,30023`).
    kinds: Option<String>,
    /// Comma-separated `key:value` tag constraints, e.g. `t:news,p:abc`.
    tag: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

fn csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_num<T: std::str::FromStr>(field: &str, v: Option<&String>) -> Result<Option<T>, String> {
    v.map(|s| s.trim().parse().map_err(|_| format!("invalid {field}: {s}")))
        .transpose()
}

/// Convert query string parameters into a [`Filter`].
///
/// Example: `/query?authors=<hex>&kinds=1,30023&tag=t:news&since=1700000000`
fn params_to_filter(params: &QueryParams) -> Result<Filter, String> {
    let kinds = match &params.kinds {
        Some(k) => Some(
            csv(k)
                .iter()
                .map(|v| v.parse::<u32>().map_err(|_| format!("invalid kind: {v}")))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };
    let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(t) = &params.tag {
        for pair in csv(t) {
            let (key, value) = pair
                .split_once(':')
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("invalid tag: {pair}"))?;
            tags.entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    Ok(Filter {
        ids: params.ids.as_deref().map(csv),
        authors: params.authors.as_deref().map(csv),
        kinds,
        tags,
        since: parse_num("since", params.since.as_ref())?,
        until: parse_num("until", params.until.as_ref())?,
        limit: parse_num("limit", params.limit.as_ref())?,
    })
}

/// Matching visible events as newline-delimited JSON, newest first.
async fn query(State(state): State<AppState>, AxumQuery(params): AxumQuery<QueryParams>) -> Response {
    let filter = match params_to_filter(&params) {
        Ok(f) => f,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    match state.relay.query(vec![filter]).await {
        Ok(events) => {
            debug!(events = events.len(), "GET /query");
            (
                [(header::CONTENT_TYPE, "application/x-ndjson")],
                events.join("\n"),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "query endpoint failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
