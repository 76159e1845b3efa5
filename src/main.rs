//! Command line interface for operating the relay. Supports initialization,
//! importing events, serving the relay with federation, maintenance of the
//! store, and management of federation peers.

mod config;
mod error;
mod event;
mod federation;
mod filter;
mod ingest;
mod message;
mod registry;
mod server;
mod storage;
mod ws;

#[cfg(test)]
mod tests;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use event::Event;
use federation::{Federation, PeerOptions};
use ingest::{IngestOutcome, Origin, Relay};
use storage::Store;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "relayd", author, version, about = "Federating Nostr relay backed by SQLite")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` if missing and create the database.
    Init,
    /// Import one or more files of events (one JSON event, or one per line).
    Ingest {
        /// Paths to event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild the tag index and replaceable visibility from stored events.
    Reindex,
    /// Serve WebSocket and HTTP clients and federate with configured peers.
    Serve,
    /// Verify signatures of a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Manage federation peers.
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
}

/// Operations available under `relayd peer`.
#[derive(Subcommand)]
enum PeerAction {
    /// Add a peer relay after verifying connectivity.
    Add { url: String },
    /// Remove a peer relay from the configuration.
    Remove { url: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Peer { action } => handle_peer(action, &cli.env, &cfg).await?,
        Commands::Init => {
            let store = open_store(&cfg)?;
            info!(path = %store.path().display(), "store ready");
        }
        Commands::Ingest { files } => {
            let relay = Relay::new(open_store(&cfg)?, Federation::new());
            let mut summary = IngestSummary::default();
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                for raw in event_texts(&data) {
                    let outcome = match Event::parse(raw) {
                        Ok(ev) => {
                            let raw = ev.to_raw()?;
                            relay.ingest(ev, raw, Origin::Local).await
                        }
                        Err(e) => {
                            warn!(file = %f, error = %e, "skipping malformed event");
                            IngestOutcome::Rejected(e.to_string())
                        }
                    };
                    summary.record(&outcome);
                }
            }
            println!(
                "stored {}, duplicate {}, ephemeral {}, rejected {}",
                summary.stored, summary.duplicate, summary.ephemeral, summary.rejected
            );
        }
        Commands::Reindex => {
            let n = open_store(&cfg)?.reindex()?;
            println!("reindexed {n} events");
        }
        Commands::Serve => serve(&cfg).await?,
        Commands::Verify { sample } => {
            let n = open_store(&cfg)?.verify_sample(sample)?;
            println!("verified {n} events");
        }
    }
    Ok(())
}

#[derive(Default)]
struct IngestSummary {
    stored: usize,
    duplicate: usize,
    ephemeral: usize,
    rejected: usize,
}

impl IngestSummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Stored => self.stored += 1,
            IngestOutcome::Duplicate => self.duplicate += 1,
            IngestOutcome::Ephemeral => self.ephemeral += 1,
            IngestOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Split a file into event documents: the whole file if it is one JSON
/// object, otherwise each non-empty line.
fn event_texts(data: &str) -> Vec<&str> {
    let trimmed = data.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return vec![trimmed];
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

fn open_store(cfg: &Settings) -> anyhow::Result<Store> {
    if let Some(parent) = cfg.store_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&cfg.store_path)
        .with_context(|| format!("opening {}", cfg.store_path.display()))?;
    Ok(store.with_max_limit(cfg.query_limit_max))
}

async fn serve(cfg: &Settings) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg.bind.parse().context("parsing BIND")?;
    let relay = Relay::new(open_store(cfg)?, Federation::new())
        .with_query_limit(cfg.query_limit_default);
    if !cfg.relays_upstream.is_empty() {
        let opts = PeerOptions {
            socks: cfg.tor_socks.clone(),
            lookback: cfg.federation_lookback,
            ..PeerOptions::default()
        };
        federation::spawn(relay.clone(), &cfg.relays_upstream, opts);
        info!(peers = cfg.relays_upstream.len(), "federation started");
    }
    if let Some(every) = cfg.stats_interval {
        spawn_stats(relay.clone(), every);
    }
    let state = server::AppState::new(relay, cfg.info.clone(), cfg.outbound_queue)
        .with_max_message_bytes(cfg.max_message_bytes);
    server::serve(addr, state, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
    })
    .await
}

fn spawn_stats(relay: Relay, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            relay.report_stats().await;
        }
    });
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_path = base_dir.join("relayd-data").join("events.db");
    let mut content = String::new();
    content.push_str(&format!("STORE_PATH={}\n", display_path(&store_path)));
    content.push_str("BIND=127.0.0.1:7777\n");
    content.push_str("RELAYS_UPSTREAM=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("FEDERATION_LOOKBACK_SECS=86400\n");
    content.push_str("QUERY_LIMIT_DEFAULT=500\n");
    content.push_str("QUERY_LIMIT_MAX=5000\n");
    content.push_str("MAX_MESSAGE_BYTES=1048576\n");
    content.push_str("STATS_INTERVAL_SECS=0\n");
    content.push_str("RELAY_NAME=relayd\n");
    fs::write(env_path, content)?;
    info!(path = %env_path.display(), "wrote default configuration");
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_peer(action: PeerAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        PeerAction::Add { url } => add_peer(env_path, cfg, url).await?,
        PeerAction::Remove { url } => remove_peer(env_path, cfg, url)?,
    }
    Ok(())
}

async fn add_peer(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays_upstream.iter().any(|existing| existing == &url) {
        bail!("peer already configured: {url}");
    }
    federation::test_connection(&url, cfg.tor_socks.as_deref())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let mut relays = cfg.relays_upstream.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_peer(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays_upstream.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("peer not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS_UPSTREAM=") {
            new_content.push_str(&format!("RELAYS_UPSTREAM={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS_UPSTREAM={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS_UPSTREAM", relays_joined);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use crate::{config::env_guard, event::testing::signed};
    use futures_util::StreamExt;
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn write_env(dir: &TempDir, extra: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_PATH={}\nBIND=127.0.0.1:0\nRELAYS_UPSTREAM=\n{}",
            dir.path().join("events.db").to_str().unwrap(),
            extra
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.to_string(),
            verbose: false,
            command,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn run_init_ingest_reindex_verify() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        run(cli(&env_file, Commands::Init)).await.unwrap();
        assert!(dir.path().join("events.db").exists());

        let single = dir.path().join("one.json");
        let ev = signed(1, 1, 1, &[], "one");
        fs::write(&single, serde_json::to_string_pretty(&ev).unwrap()).unwrap();
        let many = dir.path().join("many.jsonl");
        let lines = [signed(2, 1, 2, &[], "two"), signed(3, 1, 3, &[], "three")]
            .iter()
            .map(|e| e.to_raw().unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&many, lines + "\nnot json\n").unwrap();
        run(cli(
            &env_file,
            Commands::Ingest {
                files: vec![
                    single.to_str().unwrap().into(),
                    many.to_str().unwrap().into(),
                ],
            },
        ))
        .await
        .unwrap();

        let store = Store::open(&dir.path().join("events.db")).unwrap();
        assert_eq!(store.count().unwrap(), 3);
        assert!(store.exists(&ev.id).unwrap());

        run(cli(&env_file, Commands::Reindex)).await.unwrap();
        run(cli(&env_file, Commands::Verify { sample: 10 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingest_missing_file_fails() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");
        let res = run(cli(
            &env_file,
            Commands::Ingest {
                files: vec![dir.path().join("nope.json").to_str().unwrap().into()],
            },
        ))
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(cli(&env_path.to_string_lossy(), Commands::Init))
            .await
            .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected = dir.path().join("relayd-data").join("events.db");
        assert!(data.contains(&format!("STORE_PATH={}", expected.to_string_lossy())));
        assert!(data.contains("BIND=127.0.0.1:7777"));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn serve_answers_health_checks_with_peers_configured() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_PATH={}\nBIND=127.0.0.1:{port}\nRELAYS_UPSTREAM=ws://127.0.0.1:9\nSTATS_INTERVAL_SECS=1\n",
            dir.path().join("events.db").to_str().unwrap(),
        );
        fs::write(&env_path, content).unwrap();

        let handle = task::spawn(run(cli(env_path.to_str().unwrap(), Commands::Serve)));
        let url = format!("http://127.0.0.1:{port}/healthz");
        let mut ok = false;
        for _ in 0..50 {
            if let Ok(resp) = reqwest::get(&url).await {
                ok = resp.status().is_success();
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.abort();
        assert!(ok);
    }

    #[tokio::test]
    async fn peer_add_validates_and_updates_env() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(msg) = ws.next().await {
                if matches!(msg, Ok(TMsg::Close(_)) | Err(_)) {
                    break;
                }
            }
        });

        let url = format!("ws://{}", addr);
        run(cli(
            &env_file,
            Commands::Peer {
                action: PeerAction::Add { url: url.clone() },
            },
        ))
        .await
        .unwrap();
        server.await.unwrap();

        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains(&format!("RELAYS_UPSTREAM={url}")));
    }

    #[tokio::test]
    async fn peer_add_rejects_unreachable_and_duplicate() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");
        let closed = format!("ws://127.0.0.1:{}", free_port());
        let res = run(cli(
            &env_file,
            Commands::Peer {
                action: PeerAction::Add { url: closed },
            },
        ))
        .await;
        assert!(res.is_err());

        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            format!(
                "STORE_PATH={}\nBIND=127.0.0.1:0\nRELAYS_UPSTREAM=ws://one\n",
                dir.path().join("events.db").to_str().unwrap()
            ),
        )
        .unwrap();
        for key in crate::config::KEYS {
            std::env::remove_var(key);
        }
        let res = run(cli(
            env_path.to_str().unwrap(),
            Commands::Peer {
                action: PeerAction::Add {
                    url: "ws://one".into(),
                },
            },
        ))
        .await;
        assert!(res.unwrap_err().to_string().contains("already configured"));
    }

    #[tokio::test]
    async fn peer_remove_updates_env() {
        let _g = env_guard();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_PATH={}\nBIND=127.0.0.1:0\nRELAYS_UPSTREAM=ws://one,ws://two\n",
            dir.path().join("events.db").to_str().unwrap(),
        );
        fs::write(&env_path, content).unwrap();
        let env_file = env_path.to_string_lossy().into_owned();

        run(cli(
            &env_file,
            Commands::Peer {
                action: PeerAction::Remove {
                    url: "ws://one".into(),
                },
            },
        ))
        .await
        .unwrap();

        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains("RELAYS_UPSTREAM=ws://two"));
        assert!(!data.contains("ws://one"));

        std::env::remove_var("RELAYS_UPSTREAM");
        let res = run(cli(
            &env_file,
            Commands::Peer {
                action: PeerAction::Remove {
                    url: "ws://missing".into(),
                },
            },
        ))
        .await;
        assert!(res.is_err());
    }

    #[test]
    fn event_texts_accepts_documents_and_lines() {
        assert_eq!(event_texts("{\n  \"a\": 1\n}\n"), vec!["{\n  \"a\": 1\n}"]);
        assert_eq!(event_texts("{}\n\n{}\n"), vec!["{}", "{}"]);
    }
}
