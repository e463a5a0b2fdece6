//! Denormalized order-line feed splitter for Strata.
//!
//! Reads a CSV feed (one row per order line, with customer, product and
//! location attributes repeated on every line) and splits it into
//! per-dimension raw rows for the snapshot normalizer and fact events for
//! the fact assembler. Pure synchronous; no storage dependencies.
//!
//! # Quick start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use strata_feed::{FeedMapping, split};
//!
//! let mapping = FeedMapping {
//!   order_id_column: "Order ID".into(),
//!   line_column:     None,
//!   dimensions:      vec![],
//!   roles:           vec![],
//!   measures:        BTreeMap::from([("sales".into(), "Sales".into())]),
//!   lead_time:       None,
//!   margin:          None,
//! };
//! let batch = split("Order ID,Sales\nCA-1,10.5\n", &mapping).unwrap();
//! println!("{} events, {} rejected", batch.events.len(), batch.rejected.len());
//! ```

mod csv;
mod mapping;
mod split;

pub mod error;

use std::{collections::BTreeMap, path::Path};

pub use error::{Error, Result};
pub use mapping::{
  DimensionColumns, FeedMapping, LeadTime, Margin, RoleColumns, ShipModeSla,
  default_sla_days,
};
pub use split::{IS_LATE, PROCESSING_DAYS, PROFIT_MARGIN, SLA_DAYS};
use strata_core::{fact::FactEvent, snapshot::RawRow};

// ─── Public types ────────────────────────────────────────────────────────────

/// Everything one feed file contributes to a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
  /// Dimension name → raw attribute rows, one per accepted record, in feed
  /// order. Repeats of the same entity are collapsed later by the normalizer.
  pub dimension_rows: BTreeMap<String, Vec<RawRow>>,
  pub events:         Vec<FactEvent>,
  pub rejected:       Vec<RejectedRecord>,
}

/// A feed record dropped for a data-quality problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
  /// 1-based line the record starts on.
  pub line:     usize,
  pub order_id: Option<String>,
  pub reason:   String,
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Split a feed held in memory.
///
/// Fails only when the feed as a whole is unusable (no header, a mapped column
/// missing, an unterminated quote); bad records land in
/// [`FeedBatch::rejected`].
pub fn split(input: &str, mapping: &FeedMapping) -> Result<FeedBatch> {
  let table = csv::Table::parse(input)?;
  split::split_table(&table, mapping)
}

/// Read and split a feed file.
pub fn read(path: impl AsRef<Path>, mapping: &FeedMapping) -> Result<FeedBatch> {
  let input = std::fs::read_to_string(path)?;
  split(&input, mapping)
}
