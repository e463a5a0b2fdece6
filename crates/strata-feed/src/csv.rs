//! Minimal RFC 4180 reader.
//!
//! Pipeline:
//!   raw &str
//!     └─ records()  → Vec<Record>   (quotes, escaped quotes, embedded newlines)
//!          └─ Table::from_records() → header + data records
//!
//! Tolerates bare LF line endings and a leading UTF-8 byte order mark.

use std::collections::HashMap;

use crate::error::{Error, Result};

// ─── Records ─────────────────────────────────────────────────────────────────

/// One logical CSV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
  /// 1-based physical line the record starts on.
  pub line:   usize,
  pub fields: Vec<String>,
}

/// Split `input` into records. Blank lines are skipped.
pub(crate) fn records(input: &str) -> Result<Vec<Record>> {
  let input = input.strip_prefix('\u{feff}').unwrap_or(input);

  let mut out = Vec::new();
  let mut fields: Vec<String> = Vec::new();
  let mut field = String::new();
  let mut in_quotes = false;
  // Whether the current field was quoted; a quoted empty field still counts.
  let mut touched = false;
  let mut line = 1usize;
  let mut start_line = 1usize;
  let mut quote_line = 0usize;

  let mut chars = input.chars().peekable();
  while let Some(c) = chars.next() {
    if in_quotes {
      match c {
        '"' if chars.peek() == Some(&'"') => {
          chars.next();
          field.push('"');
        }
        '"' => in_quotes = false,
        '\n' => {
          line += 1;
          field.push('\n');
        }
        '\r' if chars.peek() == Some(&'\n') => {}
        _ => field.push(c),
      }
      continue;
    }

    match c {
      '"' if field.is_empty() => {
        in_quotes = true;
        touched = true;
        quote_line = line;
      }
      ',' => {
        fields.push(std::mem::take(&mut field));
        touched = true;
      }
      '\r' if chars.peek() == Some(&'\n') => {}
      '\n' => {
        finish(&mut out, &mut fields, &mut field, touched, start_line);
        touched = false;
        line += 1;
        start_line = line;
      }
      _ => field.push(c),
    }
  }

  if in_quotes {
    return Err(Error::UnterminatedQuote { line: quote_line });
  }
  finish(&mut out, &mut fields, &mut field, touched, start_line);
  Ok(out)
}

fn finish(
  out: &mut Vec<Record>,
  fields: &mut Vec<String>,
  field: &mut String,
  touched: bool,
  line: usize,
) {
  if !touched && fields.is_empty() && field.is_empty() {
    return;
  }
  fields.push(std::mem::take(field));
  out.push(Record { line, fields: std::mem::take(fields) });
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// A header row plus data records, with column lookup by name.
#[derive(Debug)]
pub(crate) struct Table {
  columns: HashMap<String, usize>,
  pub rows: Vec<Record>,
}

impl Table {
  pub fn parse(input: &str) -> Result<Self> {
    let mut records = records(input)?.into_iter();
    let header = records.next().ok_or(Error::MissingHeader)?;

    let mut columns = HashMap::new();
    for (i, name) in header.fields.into_iter().enumerate() {
      let name = name.trim().to_owned();
      if columns.insert(name.clone(), i).is_some() {
        return Err(Error::DuplicateColumn(name));
      }
    }

    Ok(Self { columns, rows: records.collect() })
  }

  /// Index of a named column.
  pub fn column(&self, name: &str) -> Result<usize> {
    self
      .columns
      .get(name)
      .copied()
      .ok_or_else(|| Error::UnknownColumn(name.to_owned()))
  }
}

/// The trimmed value at `index`, treating short records as empty.
pub(crate) fn cell(record: &Record, index: usize) -> &str {
  record.fields.get(index).map(|s| s.trim()).unwrap_or("")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fields(input: &str) -> Vec<Vec<String>> {
    records(input).unwrap().into_iter().map(|r| r.fields).collect()
  }

  #[test]
  fn plain_rows() {
    assert_eq!(fields("a,b\n1,2\n"), vec![vec!["a", "b"], vec!["1", "2"]]);
  }

  #[test]
  fn crlf_and_missing_trailing_newline() {
    assert_eq!(fields("a,b\r\n1,2"), vec![vec!["a", "b"], vec!["1", "2"]]);
  }

  #[test]
  fn quoted_fields_with_commas_quotes_and_newlines() {
    let input = "name,note\r\n\"Smith, J\",\"said \"\"hi\"\"\r\nthen left\"\r\n";
    let recs = records(input).unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].fields, vec!["Smith, J", "said \"hi\"\nthen left"]);
    assert_eq!(recs[1].line, 2);
  }

  #[test]
  fn empty_fields_are_kept() {
    assert_eq!(fields(",,\n\"\"\n"), vec![vec!["", "", ""], vec![""]]);
  }

  #[test]
  fn blank_lines_are_skipped_and_line_numbers_track_input() {
    let recs = records("a\n\nb\n").unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].line, 3);
  }

  #[test]
  fn byte_order_mark_is_ignored() {
    let table = Table::parse("\u{feff}Order ID,Sales\nCA-1,10\n").unwrap();
    assert_eq!(table.column("Order ID").unwrap(), 0);
  }

  #[test]
  fn unterminated_quote_is_an_error() {
    assert!(matches!(
      records("a\n\"open,b\n"),
      Err(Error::UnterminatedQuote { line: 2 })
    ));
  }

  #[test]
  fn table_rejects_duplicate_and_unknown_columns() {
    assert!(matches!(Table::parse("a,a\n"), Err(Error::DuplicateColumn(_))));
    assert!(matches!(Table::parse(""), Err(Error::MissingHeader)));

    let table = Table::parse("a,b\n1\n").unwrap();
    assert!(matches!(table.column("c"), Err(Error::UnknownColumn(_))));
    assert_eq!(cell(&table.rows[0], 1), "");
  }
}
