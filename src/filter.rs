//! Subscription filters: parsing, compilation, and matching.
//!
//! A [`Filter`] is the wire-level query. [`CompiledFilter`] turns it into hash
//! sets plus a [`Prefilter`], a small Bloom-style summary that lets the live
//! fan-out path discard most non-matching filters with a few bit tests before
//! the exact comparison runs.

use std::{
    collections::{BTreeMap, HashSet},
    hash::{BuildHasher, BuildHasherDefault, DefaultHasher},
};

use serde_json::{Map, Value};

use crate::{error::FilterError, event::Event};

/// Parsed filter object as sent in `REQ` messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed without the leading `#`.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Inclusive lower bound for `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound for `created_at`.
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a JSON filter object.
    ///
    /// Recognised keys are `ids`, `authors`, `kinds`, `since`, `until`,
    /// `limit`, and `#<tag>`. Unknown keys are ignored, wrongly typed known
    /// keys are an error.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_list(key, v)?),
                "authors" => filter.authors = Some(string_list(key, v)?),
                "kinds" => {
                    let arr = v.as_array().ok_or_else(|| invalid(key, "expected an array"))?;
                    let kinds = arr
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| invalid(key, "expected unsigned integers"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(unsigned(key, v)?),
                "until" => filter.until = Some(unsigned(key, v)?),
                "limit" => filter.limit = Some(unsigned(key, v)? as usize),
                _ => {
                    if let Some(tag) = key.strip_prefix('#') {
                        if tag.is_empty() {
                            return Err(invalid(key, "empty tag name"));
                        }
                        filter.tags.insert(tag.to_string(), string_list(key, v)?);
                    }
                }
            }
        }
        Ok(filter)
    }

    /// Encode back into a JSON filter object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), ids.clone().into());
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), authors.clone().into());
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), kinds.clone().into());
        }
        for (key, values) in &self.tags {
            obj.insert(format!("#{key}"), values.clone().into());
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), (limit as u64).into());
        }
        Value::Object(obj)
    }

    pub fn compile(&self) -> CompiledFilter {
        CompiledFilter::new(self.clone())
    }
}

fn invalid(field: &str, reason: &'static str) -> FilterError {
    FilterError::InvalidField {
        field: field.to_string(),
        reason,
    }
}

fn unsigned(field: &str, v: &Value) -> Result<u64, FilterError> {
    v.as_u64()
        .ok_or_else(|| invalid(field, "expected a non-negative integer"))
}

fn string_list(field: &str, v: &Value) -> Result<Vec<String>, FilterError> {
    let arr = v.as_array().ok_or_else(|| invalid(field, "expected an array"))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(field, "expected strings"))
        })
        .collect()
}

/// Filter in a form optimised for repeated matching.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    source: Filter,
    ids: Option<HashSet<String>>,
    authors: Option<HashSet<String>>,
    kinds: Option<HashSet<u32>>,
    tags: Vec<(String, HashSet<String>)>,
    prefilter: Prefilter,
}

impl CompiledFilter {
    fn new(source: Filter) -> Self {
        let to_set = |v: &Option<Vec<String>>| v.as_ref().map(|v| v.iter().cloned().collect());
        let ids = to_set(&source.ids);
        let authors = to_set(&source.authors);
        let kinds = source.kinds.as_ref().map(|k| k.iter().copied().collect());
        let tags = source
            .tags
            .iter()
            .map(|(k, vals)| (k.clone(), vals.iter().cloned().collect()))
            .collect();
        let prefilter = Prefilter::new(&source);
        Self {
            source,
            ids,
            authors,
            kinds,
            tags,
            prefilter,
        }
    }

    /// The filter this was compiled from.
    pub fn filter(&self) -> &Filter {
        &self.source
    }

    /// Exact match: every constrained field must be satisfied.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.source.since.is_some_and(|s| ev.created_at < s) {
            return false;
        }
        if self.source.until.is_some_and(|u| ev.created_at > u) {
            return false;
        }
        self.tags.iter().all(|(key, values)| {
            ev.tag_pairs()
                .any(|(k, v)| k == key.as_str() && values.contains(v))
        })
    }

    /// Cheap pre-check. May return `true` for events that do not match, never
    /// `false` for events that do.
    pub fn may_match(&self, fp: &Fingerprint) -> bool {
        self.prefilter.may_match(fp)
    }

    /// Pre-check followed by the exact comparison.
    pub fn matches_fingerprinted(&self, ev: &Event, fp: &Fingerprint) -> bool {
        self.may_match(fp) && self.matches(ev)
    }
}

/// True if any filter in the set matches (filters are OR-combined).
pub fn matches_any(filters: &[CompiledFilter], ev: &Event) -> bool {
    let fp = Fingerprint::of(ev);
    filters.iter().any(|f| f.matches_fingerprinted(ev, &fp))
}

type FixedState = BuildHasherDefault<DefaultHasher>;

const BLOOM_HASHES: u64 = 3;
const BLOOM_BITS_PER_ITEM: usize = 10;

fn hash_str(s: &str) -> u64 {
    FixedState::default().hash_one(s)
}

fn hash_tag(key: &str, value: &str) -> u64 {
    FixedState::default().hash_one((key, value))
}

/// Per-event hashes, computed once and reused against every live filter.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    id: u64,
    author: u64,
    tags: Vec<u64>,
    kind: u32,
    created_at: u64,
}

impl Fingerprint {
    pub fn of(ev: &Event) -> Self {
        Self {
            id: hash_str(&ev.id),
            author: hash_str(&ev.pubkey),
            tags: ev.tag_pairs().map(|(k, v)| hash_tag(k, v)).collect(),
            kind: ev.kind,
            created_at: ev.created_at,
        }
    }
}

/// Fixed-size bit set answering "possibly present" / "definitely absent".
#[derive(Debug, Clone)]
struct Bloom {
    bits: Vec<u64>,
}

impl Bloom {
    fn with_hashes(hashes: impl ExactSizeIterator<Item = u64>) -> Self {
        let nbits = (hashes.len() * BLOOM_BITS_PER_ITEM).max(64).next_power_of_two();
        let mut bloom = Self {
            bits: vec![0; nbits / 64],
        };
        for h in hashes {
            for pos in bloom.positions(h) {
                bloom.bits[pos / 64] |= 1 << (pos % 64);
            }
        }
        bloom
    }

    fn positions(&self, h: u64) -> impl Iterator<Item = usize> {
        let mask = (self.bits.len() * 64 - 1) as u64;
        let (h1, h2) = (h & 0xffff_ffff, (h >> 32) | 1);
        (0..BLOOM_HASHES).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) & mask) as usize)
    }

    fn contains(&self, h: u64) -> bool {
        self.positions(h)
            .all(|pos| (self.bits[pos / 64] & (1 << (pos % 64))) != 0)
    }
}

/// Approximate summary of a filter used as a fast rejection test.
#[derive(Debug, Clone)]
struct Prefilter {
    ids: Option<Bloom>,
    authors: Option<Bloom>,
    tags: Option<Bloom>,
    kind_range: Option<(u32, u32)>,
    since: u64,
    until: u64,
    /// Set when some constraint is an empty list, which nothing can satisfy.
    impossible: bool,
}

impl Prefilter {
    fn new(f: &Filter) -> Self {
        let bloom_of = |v: &Option<Vec<String>>| {
            v.as_ref()
                .map(|vals| Bloom::with_hashes(vals.iter().map(|s| hash_str(s))))
        };
        let tags = if f.tags.is_empty() {
            None
        } else {
            let hashes: Vec<u64> = f
                .tags
                .iter()
                .flat_map(|(k, vals)| vals.iter().map(move |v| hash_tag(k, v)))
                .collect();
            Some(Bloom::with_hashes(hashes.into_iter()))
        };
        let kind_range = f.kinds.as_ref().and_then(|k| {
            let min = k.iter().min()?;
            let max = k.iter().max()?;
            Some((*min, *max))
        });
        let impossible = f.ids.as_ref().is_some_and(Vec::is_empty)
            || f.authors.as_ref().is_some_and(Vec::is_empty)
            || f.kinds.as_ref().is_some_and(Vec::is_empty)
            || f.tags.values().any(Vec::is_empty);
        Self {
            ids: bloom_of(&f.ids),
            authors: bloom_of(&f.authors),
            tags,
            kind_range,
            since: f.since.unwrap_or(0),
            until: f.until.unwrap_or(u64::MAX),
            impossible,
        }
    }

    fn may_match(&self, fp: &Fingerprint) -> bool {
        if self.impossible || fp.created_at < self.since || fp.created_at > self.until {
            return false;
        }
        if let Some((lo, hi)) = self.kind_range {
            if fp.kind < lo || fp.kind > hi {
                return false;
            }
        }
        if let Some(b) = &self.ids {
            if !b.contains(fp.id) {
                return false;
            }
        }
        if let Some(b) = &self.authors {
            if !b.contains(fp.author) {
                return false;
            }
        }
        if let Some(b) = &self.tags {
            if !fp.tags.iter().any(|h| b.contains(*h)) {
                return false;
            }
        }
        true
    }
}
