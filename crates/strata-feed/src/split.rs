//! Record → (dimension rows, fact event) splitting.
//!
//! Pipeline:
//!   Table
//!     └─ split_record()        → FactEvent   (order id, line, roles, measures)
//!          └─ derive_measures() → FactEvent   (lead time, SLA, margin)
//!     └─ dimension_rows()      → RawRow per mapped dimension
//!
//! A record whose order id, line, role dates or measures cannot be parsed is
//! rejected as a whole and contributes neither an event nor dimension rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use strata_core::{
  fact::FactEvent,
  snapshot::{RawRow, parse_date, parse_decimal},
};

use crate::{
  FeedBatch, RejectedRecord,
  csv::{Record, Table, cell},
  error::{Error, Result},
  mapping::FeedMapping,
};

pub const PROCESSING_DAYS: &str = "processing_days";
pub const SLA_DAYS: &str = "sla_days";
pub const IS_LATE: &str = "is_late";
pub const PROFIT_MARGIN: &str = "profit_margin";

// ─── Mapping checks ──────────────────────────────────────────────────────────

fn validate(mapping: &FeedMapping, table: &Table) -> Result<()> {
  for column in mapping.required_columns() {
    table.column(column)?;
  }

  let mut dimensions = HashSet::new();
  for d in &mapping.dimensions {
    if !dimensions.insert(d.dimension.as_str()) {
      return Err(Error::InvalidMapping(format!(
        "dimension {:?} is mapped twice",
        d.dimension
      )));
    }
  }

  let mut roles = HashSet::new();
  for r in &mapping.roles {
    if !roles.insert(r.role.as_str()) {
      return Err(Error::InvalidMapping(format!("role {:?} is mapped twice", r.role)));
    }
  }

  let mut derived = Vec::new();
  if mapping.lead_time.is_some() {
    derived.extend([PROCESSING_DAYS, SLA_DAYS, IS_LATE]);
  }
  if mapping.margin.is_some() {
    derived.push(PROFIT_MARGIN);
  }
  if let Some(clash) = derived.iter().find(|m| mapping.measures.contains_key(**m)) {
    return Err(Error::InvalidMapping(format!(
      "measure {clash:?} is derived and cannot also be mapped to a column"
    )));
  }
  Ok(())
}

// ─── Splitting ───────────────────────────────────────────────────────────────

pub(crate) fn split_table(table: &Table, mapping: &FeedMapping) -> Result<FeedBatch> {
  validate(mapping, table)?;

  let mut batch = FeedBatch {
    dimension_rows: mapping
      .dimensions
      .iter()
      .map(|d| (d.dimension.clone(), Vec::new()))
      .collect(),
    ..FeedBatch::default()
  };
  let mut ordinals: HashMap<String, u32> = HashMap::new();
  let mut seen_lines: HashSet<(String, u32)> = HashSet::new();

  for record in &table.rows {
    let order_id = cell(record, table.column(&mapping.order_id_column)?).to_owned();
    let ordinal = ordinals.entry(order_id.clone()).or_insert(0);
    *ordinal += 1;
    let ordinal = *ordinal;

    let outcome = split_record(table, mapping, record, &order_id, ordinal)
      .and_then(|event| {
        if seen_lines.insert((event.order_id.clone(), event.line)) {
          Ok(event)
        } else {
          Err(format!("order line {}/{} appears twice", event.order_id, event.line))
        }
      });

    match outcome {
      Ok(event) => {
        for d in &mapping.dimensions {
          let row = dimension_row(table, record, &d.key_column, &d.attributes)?;
          if let Some(rows) = batch.dimension_rows.get_mut(&d.dimension) {
            rows.push(row);
          }
        }
        batch.events.push(event);
      }
      Err(reason) => batch.rejected.push(RejectedRecord {
        line: record.line,
        order_id: Some(order_id).filter(|id| !id.is_empty()),
        reason,
      }),
    }
  }

  Ok(batch)
}

/// Build the fact event for one record. Errors are row-level reasons.
fn split_record(
  table: &Table,
  mapping: &FeedMapping,
  record: &Record,
  order_id: &str,
  ordinal: u32,
) -> Result<FactEvent, String> {
  let column = |name: &str| table.column(name).map_err(|e| e.to_string());
  let text = |name: &str| column(name).map(|i| cell(record, i));

  if order_id.is_empty() {
    return Err("missing order id".into());
  }

  let line = match &mapping.line_column {
    None => ordinal,
    Some(name) => {
      let raw = text(name)?;
      match raw.parse::<u32>() {
        Ok(n) if n >= 1 => n,
        _ => return Err(format!("line {raw:?} is not a positive integer")),
      }
    }
  };

  let mut event = FactEvent::new(order_id, line);

  for role in &mapping.roles {
    let key = text(&role.key_column)?;
    let raw_date = text(&role.date_column)?;
    let at = parse_date(raw_date).ok_or_else(|| {
      format!("role {}: {raw_date:?} is not a recognised date", role.role)
    })?;
    // An empty key leaves the role unset; the assembler treats it as
    // unresolved.
    if !key.is_empty() {
      event = event.with_role(role.role.clone(), key, at);
    }
  }

  for (measure, col) in &mapping.measures {
    let value = parse_decimal(text(col)?)
      .map_err(|reason| format!("measure {measure}: {reason}"))?;
    event = event.with_measure(measure.clone(), value);
  }

  derive_measures(&mut event.measures, mapping, |name| text(name))?;
  Ok(event)
}

/// Add the lead-time and margin measures configured in `mapping`.
fn derive_measures<'r>(
  measures: &mut BTreeMap<String, f64>,
  mapping: &FeedMapping,
  text: impl Fn(&str) -> Result<&'r str, String>,
) -> Result<(), String> {
  if let Some(lt) = &mapping.lead_time {
    let date = |name: &str| -> Result<NaiveDate, String> {
      let raw = text(name)?;
      parse_date(raw).ok_or_else(|| format!("{name}: {raw:?} is not a recognised date"))
    };
    let ordered = date(&lt.order_date_column)?;
    let shipped = date(&lt.ship_date_column)?;
    let processing = (shipped - ordered).num_days();
    let sla = lt.sla_for(text(&lt.ship_mode_column)?);

    measures.insert(PROCESSING_DAYS.into(), processing as f64);
    measures.insert(SLA_DAYS.into(), sla as f64);
    measures.insert(IS_LATE.into(), if processing > sla { 1.0 } else { 0.0 });
  }

  if let Some(m) = &mapping.margin {
    let number = |name: &str| -> Result<f64, String> {
      parse_decimal(text(name)?).map_err(|reason| format!("{name}: {reason}"))
    };
    let profit = number(&m.profit_column)?;
    let sales = number(&m.sales_column)?;
    if sales != 0.0 {
      measures.insert(PROFIT_MARGIN.into(), profit / sales);
    }
  }
  Ok(())
}

fn dimension_row(
  table: &Table,
  record: &Record,
  key_column: &str,
  attributes: &BTreeMap<String, String>,
) -> Result<RawRow> {
  let mut row = RawRow::new(cell(record, table.column(key_column)?));
  for (attribute, column) in attributes {
    row = row.field(attribute.clone(), cell(record, table.column(column)?));
  }
  Ok(row)
}
