//! Change applier: normalized snapshots → minimal ledger operations.
//!
//! For each natural key the applier compares the incoming snapshot with the
//! key's current version and either does nothing, opens a first version, or
//! supersedes the current one. Keys are spread across worker tasks by a hash
//! of the natural key, so each key's chain is only ever touched by one worker
//! and different keys proceed in parallel.
//!
//! A key whose update breaks an interval or same-day rule is recorded in the
//! report and does not stop the other keys. A failure of the ledger backend
//! itself aborts the whole apply, so no facts are resolved against a chain
//! that may not reflect the batch.

use std::{
  hash::{DefaultHasher, Hash, Hasher},
  sync::Arc,
};

use chrono::NaiveDate;
use strata_core::{
  dimension::{DimensionVersion, NaturalKey, NewVersion, SurrogateKey},
  issuer::KeyIssuer,
  ledger::{LedgerError, VersionLedger},
  snapshot::{NormalizedBatch, Snapshot, TieBreak},
};
use tokio::task::JoinSet;

use crate::error::{Error, Result};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// What happened to one natural key.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
  /// First sighting: a version was opened.
  Inserted(DimensionVersion),
  /// The current version was closed and a new one opened.
  Superseded {
    closed: DimensionVersion,
    opened: DimensionVersion,
  },
  /// The snapshot matches the version valid at the effective date.
  Unchanged(SurrogateKey),
  /// A same-day conflict kept the existing version (`first_row_wins`).
  Kept(SurrogateKey),
}

/// A natural key whose update broke a ledger rule and was left as it was.
#[derive(Debug)]
pub struct KeyFailure {
  pub natural_key: NaturalKey,
  pub error:       strata_core::Error,
}

/// Why [`apply_key`] did not produce a [`Change`].
#[derive(Debug)]
pub enum KeyError<E> {
  /// The update would break a ledger rule; only this key is affected.
  Rule(strata_core::Error),
  /// The backend failed.
  Store(E),
}

impl<E: LedgerError> From<E> for KeyError<E> {
  fn from(e: E) -> Self {
    match e.into_core() {
      Ok(rule) => Self::Rule(rule),
      Err(e) => Self::Store(e),
    }
  }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
  pub dimension:  String,
  pub inserted:   usize,
  pub superseded: usize,
  pub unchanged:  usize,
  pub kept:       usize,
  pub failures:   Vec<KeyFailure>,
}

impl ApplyReport {
  fn record(&mut self, natural_key: NaturalKey, outcome: Result<Change, strata_core::Error>) {
    match outcome {
      Ok(Change::Inserted(_)) => self.inserted += 1,
      Ok(Change::Superseded { .. }) => self.superseded += 1,
      Ok(Change::Unchanged(_)) => self.unchanged += 1,
      Ok(Change::Kept(_)) => self.kept += 1,
      Err(error) => {
        tracing::warn!(
          dimension = %self.dimension,
          natural_key = %natural_key,
          error = %error,
          "key update failed"
        );
        self.failures.push(KeyFailure { natural_key, error });
      }
    }
  }
}

// ─── Applier ─────────────────────────────────────────────────────────────────

pub struct ChangeApplier<L, I> {
  ledger:    Arc<L>,
  issuer:    Arc<I>,
  tie_break: TieBreak,
  workers:   usize,
}

impl<L, I> ChangeApplier<L, I>
where
  L: VersionLedger + 'static,
  I: KeyIssuer + 'static,
{
  pub fn new(ledger: Arc<L>, issuer: Arc<I>) -> Self {
    Self { ledger, issuer, tie_break: TieBreak::default(), workers: 4 }
  }

  pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
    self.tie_break = tie_break;
    self
  }

  /// Number of worker tasks; values below 1 are treated as 1.
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  /// Apply one normalized batch at `effective_date`. Returns once every
  /// worker has finished.
  pub async fn apply(
    &self,
    batch: NormalizedBatch,
    effective_date: NaiveDate,
  ) -> Result<ApplyReport> {
    let dimension: Arc<str> = Arc::from(batch.dimension.as_str());

    let mut partitions: Vec<Vec<Snapshot>> = vec![Vec::new(); self.workers];
    for snapshot in batch.snapshots {
      partitions[partition(&snapshot.natural_key, self.workers)].push(snapshot);
    }

    let mut tasks = JoinSet::new();
    for snapshots in partitions.into_iter().filter(|p| !p.is_empty()) {
      let ledger = Arc::clone(&self.ledger);
      let issuer = Arc::clone(&self.issuer);
      let dimension = Arc::clone(&dimension);
      let tie_break = self.tie_break;

      tasks.spawn(async move {
        let mut outcomes = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
          let key = snapshot.natural_key.clone();
          match apply_key(
            ledger.as_ref(),
            issuer.as_ref(),
            tie_break,
            &dimension,
            snapshot,
            effective_date,
          )
          .await
          {
            Ok(change) => outcomes.push((key, Ok(change))),
            Err(KeyError::Rule(e)) => outcomes.push((key, Err(e))),
            Err(KeyError::Store(e)) => return Err((key, e)),
          }
        }
        Ok(outcomes)
      });
    }

    let mut report = ApplyReport {
      dimension: dimension.to_string(),
      ..ApplyReport::default()
    };
    while let Some(joined) = tasks.join_next().await {
      match joined? {
        Ok(outcomes) => {
          for (key, outcome) in outcomes {
            report.record(key, outcome);
          }
        }
        Err((key, e)) => {
          tracing::error!(
            dimension = %report.dimension,
            natural_key = %key,
            error = %e,
            "ledger failed, aborting apply"
          );
          // Dropping the set aborts the remaining workers.
          return Err(Error::store(e));
        }
      }
    }

    tracing::info!(
      dimension = %report.dimension,
      %effective_date,
      inserted = report.inserted,
      superseded = report.superseded,
      unchanged = report.unchanged,
      kept = report.kept,
      failed = report.failures.len(),
      "applied dimension changes"
    );
    Ok(report)
  }
}

/// Worker index for a natural key.
pub fn partition(natural_key: &NaturalKey, workers: usize) -> usize {
  let mut hasher = DefaultHasher::new();
  natural_key.hash(&mut hasher);
  (hasher.finish() % workers.max(1) as u64) as usize
}

// ─── Per-key decision ────────────────────────────────────────────────────────

/// Bring one key's chain in line with `snapshot` as of `date`.
pub async fn apply_key<L, I>(
  ledger: &L,
  issuer: &I,
  tie_break: TieBreak,
  dimension: &str,
  snapshot: Snapshot,
  date: NaiveDate,
) -> Result<Change, KeyError<L::Error>>
where
  L: VersionLedger,
  I: KeyIssuer + ?Sized,
{
  let Snapshot { natural_key, attributes } = snapshot;
  let current = ledger.current_version(dimension, &natural_key).await?;

  let Some(current) = current else {
    let opened = ledger
      .append(NewVersion {
        surrogate_key: issuer.issue(),
        dimension: dimension.to_owned(),
        natural_key,
        attributes,
        valid_from: date,
      })
      .await?;
    tracing::debug!(dimension, natural_key = %opened.natural_key, key = %opened.surrogate_key, "opened first version");
    return Ok(Change::Inserted(opened));
  };

  if current.attributes == attributes {
    return Ok(Change::Unchanged(current.surrogate_key));
  }

  if date < current.valid_from {
    // Rerun of an earlier batch: fine as long as history already agrees.
    let past = ledger.version_at(dimension, &natural_key, date).await?;
    return match past {
      Some(v) if v.attributes == attributes => Ok(Change::Unchanged(v.surrogate_key)),
      _ => Err(KeyError::Rule(strata_core::Error::Overlap {
        dimension: dimension.to_owned(),
        natural_key,
        reason: format!(
          "effective date {date} precedes the current version's valid_from {}",
          current.valid_from
        ),
      })),
    };
  }

  if date == current.valid_from {
    match tie_break {
      TieBreak::Reject => {
        return Err(KeyError::Rule(strata_core::Error::AmbiguousSnapshot {
          dimension: dimension.to_owned(),
          natural_key,
          reason: format!(
            "version {} opened on {date} carries different attributes",
            current.surrogate_key
          ),
        }));
      }
      TieBreak::FirstRowWins => return Ok(Change::Kept(current.surrogate_key)),
      // Falls through: the existing version closes with a zero-width interval.
      TieBreak::LastRowWins => {}
    }
  }

  let replacement = NewVersion {
    surrogate_key: issuer.issue(),
    dimension: dimension.to_owned(),
    natural_key,
    attributes,
    valid_from: date,
  };
  let (closed, opened) = ledger
    .supersede(current.surrogate_key, date, replacement)
    .await?;
  Ok(Change::Superseded { closed, opened })
}
