//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file.
    pub store_path: PathBuf,
    /// Listen address for WebSocket and HTTP, e.g. `127.0.0.1:7777`.
    pub bind: String,
    /// Peer relays to federate with.
    pub relays_upstream: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port) for peer connections.
    pub tor_socks: Option<String>,
    /// How far back peer subscriptions reach on first connect.
    pub federation_lookback: Duration,
    /// Events returned per filter when a `REQ` sets no limit.
    pub query_limit_default: usize,
    /// Upper bound on events returned per filter.
    pub query_limit_max: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue: usize,
    /// Largest inbound WebSocket message; bigger ones close the connection.
    pub max_message_bytes: usize,
    /// Interval of the diagnostics reporter; `None` disables it.
    pub stats_interval: Option<Duration>,
    pub info: RelayInfo,
}

/// Operator details published in the relay information document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_path = PathBuf::from(env::var("STORE_PATH").context("STORE_PATH is not set")?);
        let bind = env::var("BIND").context("BIND is not set")?;
        let relays_upstream = csv_strings(env::var("RELAYS_UPSTREAM").unwrap_or_default());
        let tor_socks = optional("TOR_SOCKS");
        let federation_lookback =
            Duration::from_secs(number("FEDERATION_LOOKBACK_SECS", 24 * 60 * 60)?);
        let query_limit_default = number("QUERY_LIMIT_DEFAULT", 500)?;
        let query_limit_max = number("QUERY_LIMIT_MAX", 5000)?;
        let outbound_queue = number::<usize>("OUTBOUND_QUEUE", 1024)?.max(1);
        let max_message_bytes = number::<usize>("MAX_MESSAGE_BYTES", 1024 * 1024)?.max(1024);
        let stats_interval = match number("STATS_INTERVAL_SECS", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let info = RelayInfo {
            name: optional("RELAY_NAME").unwrap_or_else(|| "relayd".into()),
            description: optional("RELAY_DESCRIPTION").unwrap_or_default(),
            pubkey: optional("RELAY_PUBKEY"),
            contact: optional("RELAY_CONTACT"),
        };
        Ok(Self {
            store_path,
            bind,
            relays_upstream,
            tor_socks,
            federation_lookback,
            query_limit_default,
            query_limit_max,
            outbound_queue,
            max_message_bytes,
            stats_interval,
            info,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn number<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(v) => v.trim().parse().with_context(|| format!("{key} must be a number")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Keys read by [`Settings::from_env`].
#[cfg(test)]
pub(crate) const KEYS: [&str; 14] = [
    "STORE_PATH",
    "BIND",
    "RELAYS_UPSTREAM",
    "TOR_SOCKS",
    "FEDERATION_LOOKBACK_SECS",
    "QUERY_LIMIT_DEFAULT",
    "QUERY_LIMIT_MAX",
    "OUTBOUND_QUEUE",
    "MAX_MESSAGE_BYTES",
    "STATS_INTERVAL_SECS",
    "RELAY_NAME",
    "RELAY_DESCRIPTION",
    "RELAY_PUBKEY",
    "RELAY_CONTACT",
];

#[cfg(test)]
static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Serialise tests that touch the process environment and start them from a
/// clean slate.
#[cfg(test)]
pub(crate) fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    let guard = ENV_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for key in KEYS {
        env::remove_var(key);
    }
    guard
}
