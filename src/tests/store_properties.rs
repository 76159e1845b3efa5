//! Property-based tests for store idempotence and replaceable visibility.

use std::collections::HashMap;

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use crate::{
    event::Event,
    filter::Filter,
    storage::{InsertOutcome, Store},
};

fn event(index: usize, pubkey: &str, kind: u32, created_at: u64) -> Event {
    Event {
        id: format!("{index:064x}"),
        pubkey: pubkey.into(),
        created_at,
        kind,
        tags: vec![],
        content: String::new(),
        sig: String::new(),
    }
}

fn replaceable_stream() -> impl Strategy<Value = Vec<(String, u32, u64)>> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["p1", "p2"]).prop_map(String::from),
            prop::sample::select(vec![0u32, 3, 10_002]),
            0u64..5,
        ),
        1..12,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// After any arrival order exactly one event per (author, kind) is
    /// visible: the newest, ties going to the last inserted.
    #[test]
    fn prop_latest_replaceable_is_the_only_visible(stream in replaceable_stream()) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("events.db")).unwrap();
        let mut expected: HashMap<(String, u32), (u64, String)> = HashMap::new();
        for (i, (pubkey, kind, ts)) in stream.iter().enumerate() {
            let ev = event(i, pubkey, *kind, *ts);
            store.insert(&ev, &ev.to_raw().unwrap()).unwrap();
            let slot = expected.entry((pubkey.clone(), *kind)).or_insert((*ts, ev.id.clone()));
            if *ts >= slot.0 {
                *slot = (*ts, ev.id.clone());
            }
        }
        for ((pubkey, kind), (_, id)) in &expected {
            let f = Filter::from_value(&json!({"authors": [pubkey], "kinds": [kind]})).unwrap();
            let visible = store.query(&[f], 100).unwrap();
            prop_assert_eq!(visible.len(), 1);
            let ev: Event = serde_json::from_str(&visible[0]).unwrap();
            prop_assert_eq!(&ev.id, id);
        }
        prop_assert_eq!(store.visible_count().unwrap(), expected.len() as u64);
    }

    /// Re-inserting events never changes what is stored or visible.
    #[test]
    fn prop_insert_is_idempotent(stream in replaceable_stream()) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("events.db")).unwrap();
        let events: Vec<_> = stream
            .iter()
            .enumerate()
            .map(|(i, (p, k, ts))| event(i, p, *k, *ts))
            .collect();
        for ev in &events {
            store.insert(ev, &ev.to_raw().unwrap()).unwrap();
        }
        let visible = store.query(&[Filter::default()], 1000).unwrap();
        for ev in &events {
            prop_assert_eq!(
                store.insert(ev, &ev.to_raw().unwrap()).unwrap(),
                InsertOutcome::Duplicate
            );
        }
        prop_assert_eq!(store.count().unwrap(), events.len() as u64);
        prop_assert_eq!(store.query(&[Filter::default()], 1000).unwrap(), visible);
    }
}
