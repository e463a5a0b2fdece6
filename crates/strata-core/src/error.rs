//! Error types for `strata-core`.

use chrono::NaiveDate;
use thiserror::Error;

use crate::dimension::{NaturalKey, SurrogateKey};

#[derive(Debug, Error)]
pub enum Error {
  /// The same natural key arrived twice in one batch with different
  /// attributes and no tie-break rule allows picking one.
  #[error("ambiguous snapshot for {dimension}/{natural_key}: {reason}")]
  AmbiguousSnapshot {
    dimension:   String,
    natural_key: NaturalKey,
    reason:      String,
  },

  /// An append or close would break the interval partition of a key.
  #[error("interval overlap for {dimension}/{natural_key}: {reason}")]
  Overlap {
    dimension:   String,
    natural_key: NaturalKey,
    reason:      String,
  },

  #[error("no version of {dimension}/{natural_key} is valid at {at}")]
  UnresolvedReference {
    dimension:   String,
    natural_key: NaturalKey,
    at:          NaiveDate,
  },

  #[error("version not found: {0}")]
  VersionNotFound(SurrogateKey),

  #[error("version {0} is already closed")]
  AlreadyClosed(SurrogateKey),

  #[error("surrogate key {0} is already in use")]
  DuplicateSurrogateKey(SurrogateKey),

  #[error("row {row}: missing natural key")]
  MissingNaturalKey { row: usize },

  #[error("row {row}: invalid value for {attribute:?}: {reason}")]
  InvalidAttribute {
    row:       usize,
    attribute: String,
    reason:    String,
  },

  #[error("invalid identifier {0:?}: expected [a-z_][a-z0-9_]*")]
  InvalidIdentifier(String),

  #[error("invalid schema: {0}")]
  InvalidSchema(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
