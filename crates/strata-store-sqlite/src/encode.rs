//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Calendar dates are stored as `YYYY-MM-DD` so that string comparison is
//! chronological. Timestamps are RFC 3339 strings. Attribute maps, role keys
//! and measures are compact JSON. UUIDs are hyphenated lowercase strings.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use strata_core::{
  dimension::{Attributes, DimensionVersion, NaturalKey, SurrogateKey},
  fact::{FactEvent, FactRow, QuarantinedEvent, RowKind},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn decode_row_kind(s: &str) -> Result<RowKind> {
  s.parse().map_err(|_| Error::UnknownRowKind(s.to_owned()))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawVersion`], in order.
pub const VERSION_COLUMNS: &str = "surrogate_key, dimension, natural_key, \
                                   attributes_json, valid_from, valid_to, \
                                   recorded_at";

/// Raw values read directly from a `dimension_versions` row.
pub struct RawVersion {
  pub surrogate_key:   i64,
  pub dimension:       String,
  pub natural_key:     String,
  pub attributes_json: String,
  pub valid_from:      String,
  pub valid_to:        Option<String>,
  pub recorded_at:     String,
}

impl RawVersion {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      surrogate_key:   row.get(0)?,
      dimension:       row.get(1)?,
      natural_key:     row.get(2)?,
      attributes_json: row.get(3)?,
      valid_from:      row.get(4)?,
      valid_to:        row.get(5)?,
      recorded_at:     row.get(6)?,
    })
  }

  pub fn into_version(self) -> Result<DimensionVersion> {
    Ok(DimensionVersion {
      surrogate_key: SurrogateKey(self.surrogate_key),
      dimension:     self.dimension,
      natural_key:   NaturalKey::new(self.natural_key),
      attributes:    Attributes::from_json(&self.attributes_json)?,
      valid_from:    decode_date(&self.valid_from)?,
      valid_to:      self.valid_to.as_deref().map(decode_date).transpose()?,
      recorded_at:   decode_dt(&self.recorded_at)?,
    })
  }
}

/// Column list matching [`RawFactRow`], in order.
pub const FACT_COLUMNS: &str = "order_id, line, revision, kind, keys_json, \
                                measures_json, unknown_roles_json, batch_id, \
                                recorded_at";

/// Raw values read directly from a `facts` row.
pub struct RawFactRow {
  pub order_id:           String,
  pub line:               u32,
  pub revision:           u32,
  pub kind:               String,
  pub keys_json:          String,
  pub measures_json:      String,
  pub unknown_roles_json: String,
  pub batch_id:           String,
  pub recorded_at:        String,
}

impl RawFactRow {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      order_id:           row.get(0)?,
      line:               row.get(1)?,
      revision:           row.get(2)?,
      kind:               row.get(3)?,
      keys_json:          row.get(4)?,
      measures_json:      row.get(5)?,
      unknown_roles_json: row.get(6)?,
      batch_id:           row.get(7)?,
      recorded_at:        row.get(8)?,
    })
  }

  pub fn encode(row: &FactRow) -> Result<Self> {
    Ok(Self {
      order_id:           row.order_id.clone(),
      line:               row.line,
      revision:           row.revision,
      kind:               row.kind.to_string(),
      keys_json:          serde_json::to_string(&row.keys)?,
      measures_json:      serde_json::to_string(&row.measures)?,
      unknown_roles_json: serde_json::to_string(&row.unknown_roles)?,
      batch_id:           encode_uuid(row.batch_id),
      recorded_at:        encode_dt(row.recorded_at),
    })
  }

  pub fn into_fact_row(self) -> Result<FactRow> {
    let keys: BTreeMap<String, SurrogateKey> = serde_json::from_str(&self.keys_json)?;
    let measures: BTreeMap<String, f64> = serde_json::from_str(&self.measures_json)?;
    Ok(FactRow {
      order_id: self.order_id,
      line: self.line,
      revision: self.revision,
      kind: decode_row_kind(&self.kind)?,
      keys,
      measures,
      unknown_roles: serde_json::from_str(&self.unknown_roles_json)?,
      batch_id: decode_uuid(&self.batch_id)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}

/// Raw values read directly from a `quarantine` row.
pub struct RawQuarantined {
  pub batch_id:     String,
  pub event_json:   String,
  pub reasons_json: String,
  pub recorded_at:  String,
}

impl RawQuarantined {
  pub fn into_quarantined(self) -> Result<QuarantinedEvent> {
    let event: FactEvent = serde_json::from_str(&self.event_json)?;
    Ok(QuarantinedEvent {
      event,
      reasons: serde_json::from_str(&self.reasons_json)?,
      batch_id: decode_uuid(&self.batch_id)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}
