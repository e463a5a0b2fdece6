//! The `VersionLedger` and `FactStore` traits, plus the interval checks every
//! backend runs before it writes.
//!
//! The traits are implemented by storage backends (the in-memory
//! [`crate::memory::MemoryStore`] and `strata-store-sqlite`). The pipeline in
//! `strata-etl` depends on these abstractions, not on any concrete backend.

use std::future::Future;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::{
  Error, Result,
  dimension::{DimensionVersion, NaturalKey, NewVersion, SurrogateKey},
  fact::{FactRow, QuarantinedEvent},
};

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Error type of a ledger backend. Separates rule violations raised by the
/// checks below from failures of the backend itself.
pub trait LedgerError: std::error::Error + Send + Sync + Sized + 'static {
  /// `Ok` with the underlying [`Error`] if a domain rule rejected the call,
  /// `Err(self)` for storage failures.
  fn into_core(self) -> Result<Error, Self>;
}

impl LedgerError for Error {
  fn into_core(self) -> Result<Error, Self> { Ok(self) }
}

/// Append-only store of dimension versions, indexed by
/// `(dimension, natural_key)`.
///
/// Every write validates the key's full chain so that, per natural key,
/// intervals stay contiguous and non-overlapping and at most one version is
/// open. A failed write leaves the chain untouched.
///
/// All methods return `Send` futures so the trait can be used from worker
/// tasks on a multi-threaded tokio runtime.
pub trait VersionLedger: Send + Sync {
  type Error: LedgerError;

  /// The open version of a key, if any.
  fn current_version<'a>(
    &'a self,
    dimension: &'a str,
    natural_key: &'a NaturalKey,
  ) -> impl Future<Output = Result<Option<DimensionVersion>, Self::Error>> + Send + 'a;

  /// Open a new version. Fails with [`Error::Overlap`] if the key already has
  /// an open version or if `valid_from` does not meet the end of the most
  /// recently closed one.
  fn append(
    &self,
    version: NewVersion,
  ) -> impl Future<Output = Result<DimensionVersion, Self::Error>> + Send + '_;

  /// Close an open version at `valid_to` (exclusive).
  fn close(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
  ) -> impl Future<Output = Result<DimensionVersion, Self::Error>> + Send + '_;

  /// Close `surrogate_key` at `valid_to` and open `replacement` as one atomic
  /// step; no reader observes zero or two open versions for the key.
  ///
  /// Returns `(closed, opened)`.
  fn supersede(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
    replacement: NewVersion,
  ) -> impl Future<Output = Result<(DimensionVersion, DimensionVersion), Self::Error>>
  + Send
  + '_;

  /// The version whose `[valid_from, valid_to)` contains `at`.
  fn version_at<'a>(
    &'a self,
    dimension: &'a str,
    natural_key: &'a NaturalKey,
    at: NaiveDate,
  ) -> impl Future<Output = Result<Option<DimensionVersion>, Self::Error>> + Send + 'a;

  /// All versions of a key in chronological order (see
  /// [`crate::dimension::chronological`]).
  fn history<'a>(
    &'a self,
    dimension: &'a str,
    natural_key: &'a NaturalKey,
  ) -> impl Future<Output = Result<Vec<DimensionVersion>, Self::Error>> + Send + 'a;

  /// Highest surrogate key ever written, used to resume issuance.
  fn max_surrogate_key(
    &self,
  ) -> impl Future<Output = Result<Option<SurrogateKey>, Self::Error>> + Send + '_;
}

/// Append-only fact rows and the quarantine stream. Shares the ledger's error
/// type so a single backend can serve both.
pub trait FactStore: VersionLedger {
  /// Persist a row. Returns `false` without writing if a row with the same
  /// `(order_id, line, revision)` already exists.
  fn append_fact(
    &self,
    row: FactRow,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Every revision of one order line, ordered by revision.
  fn fact_rows<'a>(
    &'a self,
    order_id: &'a str,
    line: u32,
  ) -> impl Future<Output = Result<Vec<FactRow>, Self::Error>> + Send + 'a;

  /// Record an unresolved event. An earlier entry for the same order line is
  /// replaced, so reruns of a batch keep one entry per line.
  fn quarantine(
    &self,
    entry: QuarantinedEvent,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Quarantined events, optionally restricted to one batch.
  fn quarantined(
    &self,
    batch_id: Option<Uuid>,
  ) -> impl Future<Output = Result<Vec<QuarantinedEvent>, Self::Error>> + Send + '_;
}

// ─── Interval checks ─────────────────────────────────────────────────────────

/// Validate opening `new` against the key's existing `chain`.
pub fn check_append(chain: &[DimensionVersion], new: &NewVersion) -> Result<()> {
  if new.surrogate_key.is_unknown() {
    return Err(Error::DuplicateSurrogateKey(new.surrogate_key));
  }

  if let Some(open) = chain.iter().find(|v| v.is_current()) {
    return Err(overlap(new, format!(
      "version {} is still open since {}",
      open.surrogate_key, open.valid_from
    )));
  }

  if let Some(last_end) = chain.iter().filter_map(|v| v.valid_to).max() {
    if new.valid_from < last_end {
      return Err(overlap(new, format!(
        "valid_from {} precedes the end {last_end} of the latest closed version",
        new.valid_from
      )));
    }
    if new.valid_from > last_end {
      return Err(overlap(new, format!(
        "valid_from {} leaves a gap after {last_end}",
        new.valid_from
      )));
    }
  }

  Ok(())
}

/// Validate closing `version` at `valid_to`.
pub fn check_close(version: &DimensionVersion, valid_to: NaiveDate) -> Result<()> {
  if !version.is_current() {
    return Err(Error::AlreadyClosed(version.surrogate_key));
  }
  if valid_to < version.valid_from {
    return Err(Error::Overlap {
      dimension:   version.dimension.clone(),
      natural_key: version.natural_key.clone(),
      reason:      format!(
        "valid_to {valid_to} precedes valid_from {} of version {}",
        version.valid_from, version.surrogate_key
      ),
    });
  }
  Ok(())
}

/// Validate a close + append pair against `chain` and return the closed form
/// of the superseded version. Nothing is written.
pub fn plan_supersede(
  chain: &[DimensionVersion],
  surrogate_key: SurrogateKey,
  valid_to: NaiveDate,
  replacement: &NewVersion,
) -> Result<DimensionVersion> {
  let current = chain
    .iter()
    .find(|v| v.surrogate_key == surrogate_key)
    .ok_or(Error::VersionNotFound(surrogate_key))?;

  if current.dimension != replacement.dimension
    || current.natural_key != replacement.natural_key
  {
    return Err(overlap(replacement, format!(
      "replacement does not belong to the key of version {surrogate_key}"
    )));
  }

  check_close(current, valid_to)?;

  let mut closed = current.clone();
  closed.valid_to = Some(valid_to);

  let after_close: Vec<DimensionVersion> = chain
    .iter()
    .map(|v| if v.surrogate_key == surrogate_key { closed.clone() } else { v.clone() })
    .collect();
  check_append(&after_close, replacement)?;

  Ok(closed)
}

fn overlap(new: &NewVersion, reason: String) -> Error {
  Error::Overlap {
    dimension: new.dimension.clone(),
    natural_key: new.natural_key.clone(),
    reason,
  }
}
