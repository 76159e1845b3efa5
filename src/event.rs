//! Nostr event model, canonical hashing, and signature verification.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the key and the
/// second holds the indexed value. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved. For
/// example, a `["t", "news"]` tag from the protocol is represented as
/// `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Key/value pair used for tag indexing, if the tag has at least two elements.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match self.0.as_slice() {
            [key, value, ..] => Some((key.as_str(), value.as_str())),
            _ => None,
        }
    }
}

/// Signed, immutable event as published by clients and peers.
///
/// ```json
/// {
///   "id": "4376c65d...",
///   "pubkey": "6e468422...",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["t", "news"], ["p", "f7234bd4..."]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical serialization).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `1` or `10002`.
    pub kind: u32,
    /// Arbitrary tags such as `e` (event reference) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event id.
    pub sig: String,
}

/// Storage class derived from an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Append-only, always visible once stored.
    Regular,
    /// Only the newest event per (author, kind) stays visible.
    Replaceable,
    /// Forwarded to live subscribers, never persisted.
    Ephemeral,
}

impl KindClass {
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            _ => KindClass::Regular,
        }
    }
}

impl Event {
    /// Parse an event from its JSON text.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let ev: Event = serde_json::from_str(raw)?;
        ev.check_structure()?;
        Ok(ev)
    }

    /// Parse an event from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let ev: Event = serde_json::from_value(value)?;
        ev.check_structure()?;
        Ok(ev)
    }

    fn check_structure(&self) -> Result<(), ValidationError> {
        check_hex("id", &self.id, 64)?;
        check_hex("pubkey", &self.pubkey, 64)?;
        check_hex("sig", &self.sig, 128)?;
        if let Some(index) = self.tags.iter().position(|Tag(fields)| fields.is_empty()) {
            return Err(ValidationError::EmptyTag { index });
        }
        Ok(())
    }

    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    pub fn is_replaceable(&self) -> bool {
        self.kind_class() == KindClass::Replaceable
    }

    pub fn is_ephemeral(&self) -> bool {
        self.kind_class() == KindClass::Ephemeral
    }

    /// Indexable `(key, value)` pairs from tags with at least two elements.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().filter_map(Tag::pair)
    }

    /// Recompute the event hash from its fields.
    pub fn canonical_hash(&self) -> [u8; 32] {
        let arr = serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        Sha256::digest(arr.to_string().as_bytes()).into()
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<(), ValidationError> {
        let hash = self.canonical_hash();
        if hex::encode(hash) != self.id {
            return Err(ValidationError::IdMismatch);
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|_| ValidationError::InvalidHex {
            field: "sig",
            expected: 128,
        })?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(|_| ValidationError::InvalidHex {
            field: "pubkey",
            expected: 64,
        })?;
        let sig = Signature::from_slice(&sig_bytes)?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)?;
        let msg = Message::from_digest_slice(&hash)?;
        Secp256k1::verification_only().verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }

    /// Serialized form stored in the database and sent to clients.
    pub fn to_raw(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn check_hex(field: &'static str, value: &str, expected: usize) -> Result<(), ValidationError> {
    let ok = value.len() == expected
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidHex { field, expected })
    }
}

/// Signing helpers shared by unit tests across modules.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use secp256k1::Keypair;

    fn keypair(secret: u8) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_seckey_slice(&secp, &[secret; 32]).unwrap()
    }

    /// Hex public key for the test key derived from `secret`.
    pub fn pubkey(secret: u8) -> String {
        hex::encode(keypair(secret).x_only_public_key().0.serialize())
    }

    /// Build and sign an event with the key `[secret; 32]`.
    pub fn signed(secret: u8, kind: u32, created_at: u64, tags: &[&[&str]], content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = keypair(secret);
        let mut ev = Event {
            id: String::new(),
            pubkey: pubkey(secret),
            created_at,
            kind,
            tags: tags
                .iter()
                .map(|t| Tag(t.iter().map(|s| s.to_string()).collect()))
                .collect(),
            content: content.to_string(),
            sig: String::new(),
        };
        let hash = ev.canonical_hash();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        ev.sig = secp.sign_schnorr_no_aux_rand(&msg, &kp).to_string();
        ev
    }
}

#[cfg(test)]
mod tests {
    use super::testing::signed;
    use super::*;

    #[test]
    fn kind_classes() {
        assert_eq!(KindClass::of(0), KindClass::Replaceable);
        assert_eq!(KindClass::of(3), KindClass::Replaceable);
        assert_eq!(KindClass::of(10_000), KindClass::Replaceable);
        assert_eq!(KindClass::of(19_999), KindClass::Replaceable);
        assert_eq!(KindClass::of(20_000), KindClass::Ephemeral);
        assert_eq!(KindClass::of(29_999), KindClass::Ephemeral);
        assert_eq!(KindClass::of(1), KindClass::Regular);
        assert_eq!(KindClass::of(30_023), KindClass::Regular);
    }

    #[test]
    fn signed_event_verifies() {
        let ev = signed(1, 1, 1_700_000_000, &[&["t", "news"]], "hello");
        assert!(ev.verify().is_ok());
        let raw = ev.to_raw().unwrap();
        assert_eq!(Event::parse(&raw).unwrap(), ev);
    }

    #[test]
    fn tampered_content_is_id_mismatch() {
        let mut ev = signed(1, 1, 1, &[], "hello");
        ev.content = "bye".into();
        assert!(matches!(ev.verify(), Err(ValidationError::IdMismatch)));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut ev = signed(1, 1, 1, &[], "hello");
        let other = signed(2, 1, 1, &[], "hello");
        ev.sig = other.sig;
        assert!(matches!(ev.verify(), Err(ValidationError::BadSignature(_))));
    }

    #[test]
    fn parse_rejects_empty_tag() {
        let mut v = serde_json::to_value(signed(1, 1, 1, &[], "")).unwrap();
        v["tags"] = serde_json::json!([["t", "x"], []]);
        assert!(matches!(
            Event::from_value(v),
            Err(ValidationError::EmptyTag { index: 1 })
        ));
    }

    #[test]
    fn parse_rejects_missing_fields_and_bad_hex() {
        assert!(matches!(
            Event::parse(r#"{"id":"aa"}"#),
            Err(ValidationError::Malformed(_))
        ));
        let mut v = serde_json::to_value(signed(1, 1, 1, &[], "")).unwrap();
        v["pubkey"] = "XYZ".into();
        assert!(matches!(
            Event::from_value(v),
            Err(ValidationError::InvalidHex { field: "pubkey", .. })
        ));
    }

    #[test]
    fn parse_rejects_non_string_tag_elements() {
        let mut v = serde_json::to_value(signed(1, 1, 1, &[], "")).unwrap();
        v["tags"] = serde_json::json!([["t", 5]]);
        assert!(Event::from_value(v).is_err());
    }

    #[test]
    fn canonical_hash_matches_reference() {
        let ev = signed(3, 1, 1, &[], "");
        let expected: [u8; 32] = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            Sha256::digest(serde_json::to_vec(&obj).unwrap()).into()
        };
        assert_eq!(ev.canonical_hash(), expected);
    }

    #[test]
    fn tag_pairs_skip_single_element_tags() {
        let ev = signed(1, 1, 1, &[&["t", "a"], &["x"], &["e", "b", "relay"]], "");
        let pairs: Vec<_> = ev.tag_pairs().collect();
        assert_eq!(pairs, vec![("t", "a"), ("e", "b")]);
    }
}
