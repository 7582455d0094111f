//! Peer Records
//!
//! Domain types for the replicated "mouse" records that make up the shared
//! canvas: one record per connected client, keyed by a stable id.
//!
//! # Design
//!
//! - `PeerRecord` is what the store hands back through subscriptions.
//! - `PeerFields` is a partial write; absent fields are left untouched.
//! - `PeerSet` is the client's latest view of the shared collection.
//! - `LocalIdentity` is the one record this client owns.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the shared collection holding every mouse.
pub const MICE_COLLECTION: &str = "mice";

// =============================================================================
// Identifiers
// =============================================================================

/// Stable identifier of a peer record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, globally unique identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("mouse-{}", Uuid::new_v4().simple()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Glyphs
// =============================================================================

/// Visual alphabet used for mouse symbols (Unicode dingbats U+2710..=U+274C).
#[derive(Debug, Clone, Copy)]
pub struct Glyph;

impl Glyph {
    /// First code point of the alphabet.
    pub const FIRST: u32 = 0x2710;
    /// Last code point of the alphabet (inclusive).
    pub const LAST: u32 = 0x274C;

    const FALLBACK: char = '\u{2710}';

    /// Pick a random glyph from the alphabet.
    #[must_use]
    pub fn random() -> String {
        let code = rand::rng().random_range(Self::FIRST..=Self::LAST);
        Self::from_code(code).to_string()
    }

    /// Deterministic glyph for an id, used when a record carries no symbol.
    ///
    /// Every client computes the same glyph for the same id, so nothing has
    /// to be written back to the store.
    #[must_use]
    pub fn for_id(id: &PeerId) -> String {
        // FNV-1a
        let hash = id
            .as_str()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
                (acc ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
            });
        let span = u64::from(Self::LAST - Self::FIRST + 1);
        let offset = u32::try_from(hash % span).unwrap_or(0);
        Self::from_code(Self::FIRST + offset).to_string()
    }

    /// Check whether a symbol belongs to the alphabet.
    #[must_use]
    pub fn contains(symbol: &str) -> bool {
        let mut chars = symbol.chars();
        matches!(
            (chars.next(), chars.next()),
            (Some(c), None) if (Self::FIRST..=Self::LAST).contains(&u32::from(c))
        )
    }

    fn from_code(code: u32) -> char {
        char::from_u32(code).unwrap_or(Self::FALLBACK)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Partial update of a peer record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerFields {
    /// New horizontal position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// New vertical position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// New display symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl PeerFields {
    /// Position-only update.
    #[must_use]
    pub const fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            symbol: None,
        }
    }

    /// Symbol-only update.
    #[must_use]
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self {
            x: None,
            y: None,
            symbol: Some(symbol.into()),
        }
    }

    /// Check if the update touches nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.symbol.is_none()
    }
}

/// A replicated record for one connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Record identifier.
    pub id: PeerId,
    /// Time of the last write to this record.
    pub last_update: DateTime<Utc>,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Display symbol, if one was ever assigned.
    pub symbol: Option<String>,
    /// Store write counter; `0` means the record was never written.
    pub version: u64,
}

impl PeerRecord {
    /// Create an unwritten record.
    #[must_use]
    pub const fn new(id: PeerId, last_update: DateTime<Utc>) -> Self {
        Self {
            id,
            last_update,
            x: 0.0,
            y: 0.0,
            symbol: None,
            version: 0,
        }
    }

    /// Check whether the record still needs first-time initialization.
    #[must_use]
    pub const fn needs_symbol(&self) -> bool {
        self.version == 0 || self.symbol.is_none()
    }

    /// Time elapsed since the last write, as seen at `now`.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.last_update)
    }

    /// Symbol to render: the assigned one, or a deterministic fallback.
    #[must_use]
    pub fn display_symbol(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| Glyph::for_id(&self.id))
    }

    /// Apply a partial update stamped at `stamp`.
    pub fn apply(&mut self, fields: &PeerFields, stamp: DateTime<Utc>) {
        if let Some(x) = fields.x {
            self.x = x;
        }
        if let Some(y) = fields.y {
            self.y = y;
        }
        if let Some(symbol) = &fields.symbol {
            self.symbol = Some(symbol.clone());
        }
        self.last_update = stamp;
        self.version += 1;
    }
}

// =============================================================================
// Peer Set
// =============================================================================

/// The client's current view of the shared collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSet {
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerSet {
    /// Build a set from a full snapshot. Later duplicates win.
    #[must_use]
    pub fn from_snapshot(records: impl IntoIterator<Item = PeerRecord>) -> Self {
        let peers = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self { peers }
    }

    /// Check membership.
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Number of peers, self included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterate over records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Iterate over records that are not `self_id`.
    pub fn others<'a>(&'a self, self_id: &'a PeerId) -> impl Iterator<Item = &'a PeerRecord> {
        self.peers.values().filter(move |record| &record.id != self_id)
    }

    /// Snapshot the records as a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }
}

// =============================================================================
// Local Identity
// =============================================================================

/// The record owned by this client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalIdentity {
    /// Own record id.
    pub id: PeerId,
    /// Last known local position (x).
    pub x: f64,
    /// Last known local position (y).
    pub y: f64,
    /// Own display symbol.
    pub symbol: Option<String>,
}

impl LocalIdentity {
    /// Create an identity for `id` at the origin with no symbol.
    #[must_use]
    pub const fn new(id: PeerId) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            symbol: None,
        }
    }

    /// Create an identity with a freshly generated id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(PeerId::generate())
    }

    /// Full write of every local field.
    #[must_use]
    pub fn fields(&self) -> PeerFields {
        PeerFields {
            x: Some(self.x),
            y: Some(self.y),
            symbol: self.symbol.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, secs: i64) -> PeerRecord {
        let stamp = DateTime::from_timestamp(secs, 0).unwrap();
        PeerRecord::new(PeerId::new(id), stamp)
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("mouse-"));
    }

    #[test]
    fn random_glyph_is_in_alphabet() {
        for _ in 0..200 {
            assert!(Glyph::contains(&Glyph::random()));
        }
    }

    #[test]
    fn glyph_for_id_is_deterministic() {
        let id = PeerId::new("mouse-abc");
        assert_eq!(Glyph::for_id(&id), Glyph::for_id(&id));
        assert!(Glyph::contains(&Glyph::for_id(&id)));
    }

    #[test]
    fn glyph_contains_rejects_outsiders() {
        assert!(!Glyph::contains("a"));
        assert!(!Glyph::contains(""));
        assert!(!Glyph::contains("\u{2710}\u{2711}"));
        assert!(Glyph::contains("\u{274C}"));
    }

    #[test]
    fn fresh_record_needs_symbol() {
        let mut rec = record("a", 0);
        assert!(rec.needs_symbol());

        rec.apply(&PeerFields::position(1.0, 2.0), rec.last_update);
        assert_eq!(rec.version, 1);
        assert!(rec.needs_symbol());

        rec.apply(&PeerFields::symbol("\u{2710}"), rec.last_update);
        assert!(!rec.needs_symbol());
    }

    #[test]
    fn apply_leaves_missing_fields_untouched() {
        let mut rec = record("a", 0);
        rec.apply(&PeerFields::position(3.0, 4.0), rec.last_update);
        rec.apply(&PeerFields::symbol("x"), rec.last_update);

        assert!((rec.x - 3.0).abs() < f64::EPSILON);
        assert!((rec.y - 4.0).abs() < f64::EPSILON);
        assert_eq!(rec.symbol.as_deref(), Some("x"));
        assert_eq!(rec.version, 2);
    }

    #[test]
    fn display_symbol_falls_back_to_id_glyph() {
        let rec = record("mouse-1", 0);
        assert_eq!(rec.display_symbol(), Glyph::for_id(&rec.id));
    }

    #[test]
    fn peer_set_later_duplicates_win() {
        let mut newer = record("a", 10);
        newer.x = 5.0;
        let set = PeerSet::from_snapshot(vec![record("a", 0), newer]);

        assert_eq!(set.len(), 1);
        assert!((set.get(&PeerId::new("a")).unwrap().x - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn peer_set_others_excludes_self() {
        let set = PeerSet::from_snapshot(vec![record("a", 0), record("b", 0)]);
        let me = PeerId::new("a");
        let others: Vec<_> = set.others(&me).map(|r| r.id.as_str()).collect();
        assert_eq!(others, vec!["b"]);
    }

    #[test]
    fn record_serializes_camel_case() {
        let json = serde_json::to_value(record("a", 0)).unwrap();
        assert!(json.get("lastUpdate").is_some());
        assert_eq!(json["id"], "a");
    }

    #[test]
    fn empty_fields() {
        assert!(PeerFields::default().is_empty());
        assert!(!PeerFields::position(0.0, 0.0).is_empty());
    }
}
