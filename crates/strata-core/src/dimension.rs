//! Dimension versions: the unit of SCD Type 2 history.
//!
//! A version is an immutable snapshot of an entity's attributes together with
//! the half-open interval `[valid_from, valid_to)` during which it was the
//! authoritative state. Versions are never rewritten once closed; a change of
//! attributes appends a new version instead.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

// ─── Identity ────────────────────────────────────────────────────────────────

/// The business identifier of an entity, stable across all of its versions.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
  pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for NaturalKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for NaturalKey {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for NaturalKey {
  fn from(s: String) -> Self { Self(s) }
}

/// System-assigned identifier of one dimension version. Fact rows reference
/// versions exclusively through this key.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct SurrogateKey(pub i64);

impl SurrogateKey {
  /// Reserved key standing in for a dimension reference that could not be
  /// resolved. Never issued to a real version.
  pub const UNKNOWN: Self = Self(0);

  pub fn is_unknown(self) -> bool { self == Self::UNKNOWN }
}

impl fmt::Display for SurrogateKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

// ─── Attribute values ────────────────────────────────────────────────────────

/// A typed attribute value after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
  Null,
  Text(String),
  Integer(i64),
  /// Always finite; the normalizer rejects NaN and infinities.
  Decimal(f64),
  Date(NaiveDate),
  Boolean(bool),
}

impl AttrValue {
  pub fn text(s: impl Into<String>) -> Self { Self::Text(s.into()) }

  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }
}

/// The versioned payload of a dimension row: attribute name → value, ordered
/// by name so that serialisation (and therefore the fingerprint) is
/// canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
  pub fn new() -> Self { Self::default() }

  /// Builder-style insert.
  pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
    self.0.insert(name.into(), value);
    self
  }

  pub fn insert(
    &mut self,
    name: impl Into<String>,
    value: AttrValue,
  ) -> Option<AttrValue> {
    self.0.insert(name.into(), value)
  }

  pub fn get(&self, name: &str) -> Option<&AttrValue> { self.0.get(name) }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn to_json(&self) -> Result<String> { Ok(serde_json::to_string(self)?) }

  pub fn from_json(s: &str) -> Result<Self> { Ok(serde_json::from_str(s)?) }

  /// SHA-256 hex digest of the canonical JSON form. Two attribute sets with
  /// the same fingerprint are structurally equal.
  pub fn fingerprint(&self) -> Result<String> {
    let bytes = serde_json::to_vec(self)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
  }
}

impl FromIterator<(String, AttrValue)> for Attributes {
  fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

// ─── Versions ────────────────────────────────────────────────────────────────

/// One historical state of one entity. Closed versions are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVersion {
  pub surrogate_key: SurrogateKey,
  pub dimension:     String,
  pub natural_key:   NaturalKey,
  pub attributes:    Attributes,
  /// Inclusive lower bound.
  pub valid_from:    NaiveDate,
  /// Exclusive upper bound; `None` while this is the current version.
  pub valid_to:      Option<NaiveDate>,
  /// Store-assigned; never changes after creation.
  pub recorded_at:   DateTime<Utc>,
}

impl DimensionVersion {
  /// Derived from the open interval, never stored as independent truth.
  pub fn is_current(&self) -> bool { self.valid_to.is_none() }

  /// Whether `at` falls inside `[valid_from, valid_to)`.
  pub fn contains(&self, at: NaiveDate) -> bool {
    self.valid_from <= at && self.valid_to.is_none_or(|to| at < to)
  }
}

/// Input to [`crate::ledger::VersionLedger::append`]. The surrogate key is
/// issued by the caller; `valid_to` always starts open and `recorded_at` is
/// set by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
  pub surrogate_key: SurrogateKey,
  pub dimension:     String,
  pub natural_key:   NaturalKey,
  pub attributes:    Attributes,
  pub valid_from:    NaiveDate,
}

impl NewVersion {
  pub fn into_version(self, recorded_at: DateTime<Utc>) -> DimensionVersion {
    DimensionVersion {
      surrogate_key: self.surrogate_key,
      dimension: self.dimension,
      natural_key: self.natural_key,
      attributes: self.attributes,
      valid_from: self.valid_from,
      valid_to: None,
      recorded_at,
    }
  }
}

// ─── History helpers ─────────────────────────────────────────────────────────

/// Chronological order of a key's versions: by `valid_from`, then by
/// `valid_to` with the open interval last. Zero-width versions left behind by
/// a same-day replacement therefore sort before their successor.
pub fn chronological(a: &DimensionVersion, b: &DimensionVersion) -> Ordering {
  a.valid_from.cmp(&b.valid_from).then_with(|| {
    match (a.valid_to, b.valid_to) {
      (None, None) => Ordering::Equal,
      (None, Some(_)) => Ordering::Greater,
      (Some(_), None) => Ordering::Less,
      (Some(x), Some(y)) => x.cmp(&y),
    }
  })
}

/// Find the version of a chronologically sorted history whose interval
/// contains `at`.
pub fn version_containing(
  history: &[DimensionVersion],
  at: NaiveDate,
) -> Option<&DimensionVersion> {
  let idx = history.partition_point(|v| v.valid_from <= at);
  history[..idx].last().filter(|v| v.contains(at))
}
