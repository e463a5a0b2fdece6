//! Fact events and the immutable fact rows they resolve into.
//!
//! An event carries natural keys and dates; a row carries the surrogate keys
//! those resolved to at write time. Rows are never updated. A correction is
//! expressed as a compensating reversal plus a replacement row, each under a
//! new revision number.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dimension::{NaturalKey, SurrogateKey};

// ─── Events ──────────────────────────────────────────────────────────────────

/// The entity a fact references under one role, and the date at which that
/// role must be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
  pub natural_key: NaturalKey,
  pub at:          NaiveDate,
}

/// One transactional record (an order line) as it arrives from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEvent {
  pub order_id: String,
  /// Order-line number, 1-based.
  pub line:     u32,
  pub roles:    BTreeMap<String, RoleRef>,
  pub measures: BTreeMap<String, f64>,
}

impl FactEvent {
  pub fn new(order_id: impl Into<String>, line: u32) -> Self {
    Self {
      order_id: order_id.into(),
      line,
      roles: BTreeMap::new(),
      measures: BTreeMap::new(),
    }
  }

  pub fn with_role(
    mut self,
    role: impl Into<String>,
    natural_key: impl Into<NaturalKey>,
    at: NaiveDate,
  ) -> Self {
    self.roles.insert(role.into(), RoleRef {
      natural_key: natural_key.into(),
      at,
    });
    self
  }

  pub fn with_measure(mut self, name: impl Into<String>, value: f64) -> Self {
    self.measures.insert(name.into(), value);
    self
  }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Why a row exists.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RowKind {
  /// First load of an event.
  Original,
  /// Cancels an earlier row: same keys, negated measures.
  Reversal,
  /// Corrected version of an event, resolved afresh.
  Replacement,
}

/// A persisted fact. Identified by `(order_id, line, revision)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
  pub order_id:      String,
  pub line:          u32,
  pub revision:      u32,
  pub kind:          RowKind,
  /// Role name → resolved version.
  pub keys:          BTreeMap<String, SurrogateKey>,
  pub measures:      BTreeMap<String, f64>,
  /// Roles that fell back to [`SurrogateKey::UNKNOWN`].
  pub unknown_roles: Vec<String>,
  pub batch_id:      Uuid,
  pub recorded_at:   DateTime<Utc>,
}

impl FactRow {
  pub fn is_reversal(&self) -> bool { self.kind == RowKind::Reversal }
}

/// An event diverted because at least one role could not be resolved under a
/// `quarantine` policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedEvent {
  pub event:       FactEvent,
  pub reasons:     Vec<String>,
  pub batch_id:    Uuid,
  pub recorded_at: DateTime<Utc>,
}
