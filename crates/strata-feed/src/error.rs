//! Error types for the strata-feed splitter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("feed has no header row")]
  MissingHeader,

  #[error("unterminated quoted field starting on line {line}")]
  UnterminatedQuote { line: usize },

  #[error("duplicate column {0:?} in header")]
  DuplicateColumn(String),

  #[error("mapped column {0:?} is not in the feed header")]
  UnknownColumn(String),

  #[error("invalid feed mapping: {0}")]
  InvalidMapping(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
