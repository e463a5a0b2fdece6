//! How feed columns map onto dimensions, roles and measures.
//!
//! Deserialised from the `[feed]` section of the warehouse configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Complete column mapping for one denormalized order-line feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMapping {
  pub order_id_column: String,
  /// When absent, lines are numbered 1, 2, … per order id in feed order.
  #[serde(default)]
  pub line_column:     Option<String>,
  #[serde(default)]
  pub dimensions:      Vec<DimensionColumns>,
  #[serde(default)]
  pub roles:           Vec<RoleColumns>,
  /// Measure name → column.
  #[serde(default)]
  pub measures:        BTreeMap<String, String>,
  #[serde(default)]
  pub lead_time:       Option<LeadTime>,
  #[serde(default)]
  pub margin:          Option<Margin>,
}

/// Columns carrying one dimension's natural key and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionColumns {
  pub dimension:  String,
  pub key_column: String,
  /// Attribute name → column.
  #[serde(default)]
  pub attributes: BTreeMap<String, String>,
}

/// Columns carrying the natural key and event date a role resolves with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleColumns {
  pub role:        String,
  pub key_column:  String,
  pub date_column: String,
}

/// Derives `processing_days`, `sla_days` and `is_late`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadTime {
  pub order_date_column: String,
  pub ship_date_column:  String,
  pub ship_mode_column:  String,
  /// Promised days per ship mode.
  #[serde(default = "default_sla_days")]
  pub sla_days:          Vec<ShipModeSla>,
  /// Promised days for ship modes missing from `sla_days`.
  #[serde(default = "default_unmapped_sla")]
  pub unmapped_sla_days: i64,
}

/// Kept as a list rather than a map so ship mode names survive configuration
/// sources that normalise key case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipModeSla {
  pub ship_mode: String,
  pub days:      i64,
}

/// Derives `profit_margin = profit / sales`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margin {
  pub profit_column: String,
  pub sales_column:  String,
}

pub fn default_sla_days() -> Vec<ShipModeSla> {
  [
    ("Same Day", 1),
    ("First Class", 2),
    ("Second Class", 4),
    ("Standard Class", 5),
  ]
  .into_iter()
  .map(|(mode, days)| ShipModeSla { ship_mode: mode.to_owned(), days })
  .collect()
}

fn default_unmapped_sla() -> i64 { 999 }

impl LeadTime {
  /// Promised days for a ship mode.
  pub fn sla_for(&self, ship_mode: &str) -> i64 {
    self
      .sla_days
      .iter()
      .find(|s| s.ship_mode == ship_mode)
      .map_or(self.unmapped_sla_days, |s| s.days)
  }
}

impl FeedMapping {
  /// Column names that must exist in the feed header.
  pub(crate) fn required_columns(&self) -> Vec<&str> {
    let mut columns = vec![self.order_id_column.as_str()];
    columns.extend(self.line_column.as_deref());
    for d in &self.dimensions {
      columns.push(&d.key_column);
      columns.extend(d.attributes.values().map(String::as_str));
    }
    for r in &self.roles {
      columns.push(&r.key_column);
      columns.push(&r.date_column);
    }
    columns.extend(self.measures.values().map(String::as_str));
    if let Some(lt) = &self.lead_time {
      columns.extend([
        lt.order_date_column.as_str(),
        lt.ship_date_column.as_str(),
        lt.ship_mode_column.as_str(),
      ]);
    }
    if let Some(m) = &self.margin {
      columns.extend([m.profit_column.as_str(), m.sales_column.as_str()]);
    }
    columns
  }
}
