//! SQLite-backed event store and query engine.
//!
//! Two tables back the relay:
//!
//! - `events`: one row per accepted event with its raw JSON and a `hidden`
//!   visibility flag maintained for replaceable kinds;
//! - `tags`: `(event, key, value)` rows for every tag with at least two
//!   elements, used to answer `#<tag>` constraints.
//!
//! Writes go through a single writer connection inside `BEGIN IMMEDIATE`
//! transactions. Historical queries use a separate reader connection so they
//! never wait behind the writer mutex.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::{seq::SliceRandom, thread_rng};
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, ErrorCode, Transaction,
    TransactionBehavior,
};
use tracing::{debug, info};

use crate::{
    error::{StorageError, StorageResult},
    event::{Event, KindClass},
    filter::Filter,
};

/// Hard ceiling on rows returned per filter, whatever the client asks for.
pub const DEFAULT_MAX_LIMIT: usize = 5000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind INTEGER NOT NULL,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    hidden INTEGER NOT NULL DEFAULT 0,
    raw TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_author_kind ON events(pubkey, kind);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_hidden ON events(hidden);
CREATE TABLE IF NOT EXISTS tags (
    event_seq INTEGER NOT NULL REFERENCES events(seq),
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tags_key_value ON tags(key, value);
CREATE INDEX IF NOT EXISTS idx_tags_event ON tags(event_seq);
";

/// Result of [`Store::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An event with the same id was already stored; nothing changed.
    Duplicate,
}

/// Persistent store for events and their tag index.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    max_limit: usize,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let writer = Connection::open(path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        writer.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        writer.execute_batch(SCHEMA)?;
        let reader = Connection::open(path)?;
        reader.busy_timeout(Duration::from_secs(5))?;
        debug!(path = %path.display(), "event store opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            max_limit: DEFAULT_MAX_LIMIT,
        })
    }

    /// Override the per-filter row ceiling.
    pub fn with_max_limit(mut self, max_limit: usize) -> Self {
        self.max_limit = max_limit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StorageError::Poisoned)
    }

    fn reader(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Whether an event with `id` is stored (hidden or not).
    pub fn exists(&self, id: &str) -> StorageResult<bool> {
        let conn = self.reader()?;
        let found = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Persist `ev` with its raw serialization and tag rows.
    ///
    /// Duplicate check, insert, tag extraction, and replacement hiding commit
    /// together; concurrent inserts of one id have exactly one winner.
    pub fn insert(&self, ev: &Event, raw: &str) -> StorageResult<InsertOutcome> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
            params![ev.id],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }
        let inserted = tx.execute(
            "INSERT INTO events (id, kind, pubkey, created_at, hidden, raw) VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![ev.id, ev.kind, ev.pubkey, to_sql_ts(ev.created_at), raw],
        );
        match inserted {
            Ok(_) => {}
            // Another process sharing the file got there first.
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Ok(InsertOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }
        let seq = tx.last_insert_rowid();
        insert_tags(&tx, seq, ev)?;
        if ev.is_replaceable() {
            apply_replacement(&tx, &ev.pubkey, ev.kind)?;
        }
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    /// Raw events matching any of `filters`, newest first per filter and
    /// deduplicated by id across filters.
    pub fn query(&self, filters: &[Filter], limit_default: usize) -> StorageResult<Vec<String>> {
        let conn = self.reader()?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let limit = filter
                .limit
                .unwrap_or(limit_default)
                .min(self.max_limit);
            if limit == 0 {
                continue;
            }
            let (sql, args) = build_query(filter, limit);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, raw) = row?;
                if seen.insert(id) {
                    out.push(raw);
                }
            }
        }
        Ok(out)
    }

    /// Number of stored rows, hidden ones included.
    pub fn count(&self) -> StorageResult<u64> {
        let conn = self.reader()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Number of rows served to queries.
    pub fn visible_count(&self) -> StorageResult<u64> {
        let conn = self.reader()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events WHERE hidden = 0", [], |row| {
            row.get(0)
        })?;
        Ok(n as u64)
    }

    /// Rebuild the tag index and visibility flags from the raw events.
    pub fn reindex(&self) -> StorageResult<usize> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM tags", [])?;
        tx.execute("UPDATE events SET hidden = 0", [])?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT seq, raw FROM events ORDER BY seq")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut pairs = HashSet::new();
        for (seq, raw) in &rows {
            let ev: Event = serde_json::from_str(raw)?;
            insert_tags(&tx, *seq, &ev)?;
            if ev.is_replaceable() {
                pairs.insert((ev.pubkey, ev.kind));
            }
        }
        for (author, kind) in &pairs {
            apply_replacement(&tx, author, *kind)?;
        }
        tx.commit()?;
        info!(events = rows.len(), replaceable_pairs = pairs.len(), "reindexed store");
        Ok(rows.len())
    }

    /// Re-verify signatures for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> StorageResult<usize> {
        let conn = self.reader()?;
        let mut seqs: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT seq FROM events")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        seqs.shuffle(&mut thread_rng());
        let take = sample.min(seqs.len());
        let mut stmt = conn.prepare("SELECT raw FROM events WHERE seq = ?1")?;
        for seq in seqs.iter().take(take) {
            let raw: String = stmt.query_row(params![seq], |row| row.get(0))?;
            let ev: Event = serde_json::from_str(&raw)?;
            ev.verify()?;
        }
        Ok(take)
    }
}

fn to_sql_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn insert_tags(tx: &Transaction<'_>, seq: i64, ev: &Event) -> StorageResult<()> {
    let mut stmt = tx.prepare_cached("INSERT INTO tags (event_seq, key, value) VALUES (?1, ?2, ?3)")?;
    for (key, value) in ev.tag_pairs() {
        stmt.execute(params![seq, key, value])?;
    }
    Ok(())
}

/// Hide every row for the pair, then reveal the newest (ties: last inserted).
fn apply_replacement(tx: &Transaction<'_>, author: &str, kind: u32) -> StorageResult<()> {
    if KindClass::of(kind) != KindClass::Replaceable {
        return Ok(());
    }
    tx.execute(
        "UPDATE events SET hidden = 1 WHERE pubkey = ?1 AND kind = ?2 AND hidden = 0",
        params![author, kind],
    )?;
    tx.execute(
        "UPDATE events SET hidden = 0 WHERE seq = (
            SELECT seq FROM events WHERE pubkey = ?1 AND kind = ?2
            ORDER BY created_at DESC, seq DESC LIMIT 1
        )",
        params![author, kind],
    )?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Translate one filter into a conjunctive SQL query over visible rows.
fn build_query(filter: &Filter, limit: usize) -> (String, Vec<SqlValue>) {
    let mut sql = String::from("SELECT e.id, e.raw FROM events e WHERE e.hidden = 0");
    let mut args: Vec<SqlValue> = Vec::new();

    let mut in_list = |sql: &mut String, column: &str, values: Vec<SqlValue>| {
        if values.is_empty() {
            sql.push_str(" AND 0");
        } else {
            sql.push_str(&format!(" AND {column} IN ({})", placeholders(values.len())));
            args.extend(values);
        }
    };
    if let Some(ids) = &filter.ids {
        in_list(&mut sql, "e.id", ids.iter().cloned().map(SqlValue::Text).collect());
    }
    if let Some(kinds) = &filter.kinds {
        in_list(
            &mut sql,
            "e.kind",
            kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))).collect(),
        );
    }
    if let Some(authors) = &filter.authors {
        in_list(&mut sql, "e.pubkey", authors.iter().cloned().map(SqlValue::Text).collect());
    }
    if let Some(since) = filter.since {
        sql.push_str(" AND e.created_at >= ?");
        args.push(SqlValue::Integer(to_sql_ts(since)));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND e.created_at <= ?");
        args.push(SqlValue::Integer(to_sql_ts(until)));
    }
    for (key, values) in &filter.tags {
        if values.is_empty() {
            sql.push_str(" AND 0");
            continue;
        }
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM tags t WHERE t.event_seq = e.seq AND t.key = ? AND t.value IN ({}))",
            placeholders(values.len())
        ));
        args.push(SqlValue::Text(key.clone()));
        args.extend(values.iter().cloned().map(SqlValue::Text));
    }
    sql.push_str(" ORDER BY e.created_at DESC, e.seq DESC LIMIT ?");
    args.push(SqlValue::Integer(limit as i64));
    (sql, args)
}
