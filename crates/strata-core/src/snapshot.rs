//! Snapshot normalization: raw attribute rows → one canonical record per
//! natural key.
//!
//! Pipeline:
//!   Vec<RawRow>
//!     └─ canonicalize()   → Snapshot        (trim, type, project to schema)
//!          └─ deduplicate  → NormalizedBatch (tie-break on conflicts)
//!
//! Row-level failures are collected in [`NormalizedBatch::rejected`] and do
//! not stop the batch. A conflict between two rows for the same key is a
//! batch-level failure unless a [`TieBreak`] other than `Reject` is
//! configured.

use std::collections::{BTreeMap, BTreeSet, btree_map::Entry};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  dimension::{AttrValue, Attributes, NaturalKey},
  schema::{AttrType, DimensionSchema},
};

/// Day-first formats come after ISO so that an unambiguous ISO date is never
/// reinterpreted.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];

// ─── Types ───────────────────────────────────────────────────────────────────

/// An untyped attribute row as delivered by ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
  pub natural_key: String,
  pub fields:      BTreeMap<String, String>,
}

impl RawRow {
  pub fn new(natural_key: impl Into<String>) -> Self {
    Self { natural_key: natural_key.into(), fields: BTreeMap::new() }
  }

  pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.fields.insert(name.into(), value.into());
    self
  }
}

/// How to resolve two differing snapshots of the same key within one batch.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TieBreak {
  /// Fail the batch with [`Error::AmbiguousSnapshot`].
  #[default]
  Reject,
  /// Keep the earliest row (or the version already in the ledger).
  FirstRowWins,
  /// Keep the latest row (replacing a version opened the same day).
  LastRowWins,
}

/// The canonical state of one entity in one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub natural_key: NaturalKey,
  pub attributes:  Attributes,
}

/// A row dropped for a data-quality problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
  /// Zero-based position of the row in the input.
  pub row:         usize,
  pub natural_key: Option<String>,
  pub reason:      String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
  pub dimension:  String,
  /// One per natural key, ordered by key.
  pub snapshots:  Vec<Snapshot>,
  pub rejected:   Vec<RejectedRow>,
  /// Keys whose conflict was settled by the tie-break policy.
  pub tie_broken: Vec<NaturalKey>,
}

// ─── Normalizer ──────────────────────────────────────────────────────────────

pub struct Normalizer<'a> {
  schema:    &'a DimensionSchema,
  tie_break: TieBreak,
}

impl<'a> Normalizer<'a> {
  pub fn new(schema: &'a DimensionSchema, tie_break: TieBreak) -> Self {
    Self { schema, tie_break }
  }

  pub fn normalize(
    &self,
    rows: impl IntoIterator<Item = RawRow>,
  ) -> Result<NormalizedBatch> {
    let mut accepted: BTreeMap<NaturalKey, Snapshot> = BTreeMap::new();
    let mut rejected = Vec::new();
    let mut tie_broken = BTreeSet::new();

    for (row, raw) in rows.into_iter().enumerate() {
      let snapshot = match self.canonicalize(row, &raw) {
        Ok(s) => s,
        Err(e) => {
          let natural_key = Some(raw.natural_key.trim().to_owned())
            .filter(|k| !k.is_empty());
          rejected.push(RejectedRow { row, natural_key, reason: e.to_string() });
          continue;
        }
      };

      match accepted.entry(snapshot.natural_key.clone()) {
        Entry::Vacant(slot) => {
          slot.insert(snapshot);
        }
        Entry::Occupied(mut slot) => {
          if slot.get().attributes == snapshot.attributes {
            continue;
          }
          match self.tie_break {
            TieBreak::Reject => {
              return Err(Error::AmbiguousSnapshot {
                dimension:   self.schema.name.clone(),
                natural_key: snapshot.natural_key,
                reason:      format!(
                  "row {row} carries attributes that differ from an earlier row"
                ),
              });
            }
            TieBreak::FirstRowWins => {
              tie_broken.insert(snapshot.natural_key);
            }
            TieBreak::LastRowWins => {
              tie_broken.insert(snapshot.natural_key.clone());
              slot.insert(snapshot);
            }
          }
        }
      }
    }

    Ok(NormalizedBatch {
      dimension: self.schema.name.clone(),
      snapshots: accepted.into_values().collect(),
      rejected,
      tie_broken: tie_broken.into_iter().collect(),
    })
  }

  /// Trim, type and project one row onto the schema.
  fn canonicalize(&self, row: usize, raw: &RawRow) -> Result<Snapshot> {
    let key = raw.natural_key.trim();
    if key.is_empty() {
      return Err(Error::MissingNaturalKey { row });
    }

    let mut attributes = Attributes::new();
    for spec in &self.schema.attributes {
      let text = raw
        .fields
        .get(&spec.name)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());

      let value = match text {
        None if spec.required => {
          return Err(Error::InvalidAttribute {
            row,
            attribute: spec.name.clone(),
            reason: "required value is missing".into(),
          });
        }
        None => AttrValue::Null,
        Some(text) => parse_value(spec.kind, text).map_err(|reason| {
          Error::InvalidAttribute { row, attribute: spec.name.clone(), reason }
        })?,
      };
      attributes.insert(spec.name.clone(), value);
    }

    Ok(Snapshot { natural_key: NaturalKey::new(key), attributes })
  }
}

// ─── Value parsing ───────────────────────────────────────────────────────────

fn parse_value(kind: AttrType, text: &str) -> Result<AttrValue, String> {
  match kind {
    AttrType::Text => Ok(AttrValue::Text(text.to_owned())),
    AttrType::Integer => text
      .parse::<i64>()
      .map(AttrValue::Integer)
      .map_err(|e| format!("{text:?} is not an integer: {e}")),
    AttrType::Decimal => parse_decimal(text).map(AttrValue::Decimal),
    AttrType::Date => parse_date(text)
      .map(AttrValue::Date)
      .ok_or_else(|| format!("{text:?} is not a recognised date")),
    AttrType::Boolean => match text.to_ascii_lowercase().as_str() {
      "true" | "yes" | "y" | "1" => Ok(AttrValue::Boolean(true)),
      "false" | "no" | "n" | "0" => Ok(AttrValue::Boolean(false)),
      _ => Err(format!("{text:?} is not a boolean")),
    },
  }
}

/// Parse a finite decimal number.
pub fn parse_decimal(text: &str) -> Result<f64, String> {
  let value = text
    .trim()
    .parse::<f64>()
    .map_err(|e| format!("{text:?} is not a number: {e}"))?;
  if value.is_finite() {
    Ok(value)
  } else {
    Err(format!("{text:?} is not a finite number"))
  }
}

/// Parse an ISO or day-first calendar date. A trailing time component
/// (`2023-01-01 00:00:00`, `2023-01-01T00:00:00Z`) is ignored.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
  let text = text.trim();
  let date_part = text.split([' ', 'T']).next().unwrap_or(text);
  DATE_FORMATS
    .iter()
    .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}
