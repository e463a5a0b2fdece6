//! Error type for `strata-store-sqlite`.

use strata_core::ledger::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// An interval or identity rule from `strata-core` rejected the write.
  #[error(transparent)]
  Core(#[from] strata_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("unknown fact row kind: {0:?}")]
  UnknownRowKind(String),
}

impl Error {
  /// The core error behind this one, if the failure was a domain rule rather
  /// than a storage problem.
  pub fn as_core(&self) -> Option<&strata_core::Error> {
    match self {
      Self::Core(e) => Some(e),
      _ => None,
    }
  }
}

impl LedgerError for Error {
  fn into_core(self) -> Result<strata_core::Error, Self> {
    match self {
      Self::Core(e) => Ok(e),
      other => Err(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
