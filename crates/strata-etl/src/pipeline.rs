//! Two-phase batch pipeline.
//!
//! Pipeline:
//!   Batch
//!     └─ normalize every dimension   (ambiguity aborts before any write)
//!          └─ apply every dimension   (parallel per key; awaited in full)
//!               └─ assemble facts     (resolves against the updated ledger)
//!
//! The apply phase completes for all dimensions before the first fact is
//! resolved, so facts never see a half-applied batch.

use std::{collections::BTreeMap, sync::Arc};

use chrono::NaiveDate;
use strata_core::{
  dimension::NaturalKey,
  fact::FactEvent,
  issuer::{KeyIssuer, SequenceIssuer},
  ledger::FactStore,
  schema::{DimensionSchema, FactSchema},
  snapshot::{NormalizedBatch, Normalizer, RawRow, RejectedRow, TieBreak},
};
use strata_feed::{FeedBatch, RejectedRecord};
use uuid::Uuid;

use crate::{
  applier::{ApplyReport, ChangeApplier},
  assembler::{Assembled, FactAssembler},
  config::WarehouseConfig,
  error::{Error, Result},
};

// ─── Input ───────────────────────────────────────────────────────────────────

/// Everything loaded under one effective date.
#[derive(Debug, Clone, Default)]
pub struct Batch {
  pub effective_date: NaiveDate,
  /// Dimension name → raw attribute rows.
  pub dimension_rows: BTreeMap<String, Vec<RawRow>>,
  /// First-time events.
  pub events:         Vec<FactEvent>,
  /// Events that replace what is stored for their order line.
  pub corrections:    Vec<FactEvent>,
  /// Records the feed splitter already dropped; carried into the report.
  pub feed_rejected:  Vec<RejectedRecord>,
}

impl Batch {
  pub fn new(effective_date: NaiveDate) -> Self {
    Self { effective_date, ..Self::default() }
  }

  /// A batch of first-time events from a split feed.
  pub fn from_feed(effective_date: NaiveDate, feed: FeedBatch) -> Self {
    Self {
      effective_date,
      dimension_rows: feed.dimension_rows,
      events: feed.events,
      corrections: Vec::new(),
      feed_rejected: feed.rejected,
    }
  }

  /// A batch whose events all correct previously loaded lines.
  pub fn corrections_from_feed(effective_date: NaiveDate, feed: FeedBatch) -> Self {
    Self {
      effective_date,
      dimension_rows: feed.dimension_rows,
      events: Vec::new(),
      corrections: feed.events,
      feed_rejected: feed.rejected,
    }
  }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DimensionReport {
  pub apply:      ApplyReport,
  pub rejected:   Vec<RejectedRow>,
  pub tie_broken: Vec<NaturalKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactCounts {
  pub written:        usize,
  pub corrected:      usize,
  pub already_loaded: usize,
  pub quarantined:    usize,
  /// Written rows carrying at least one unknown-member key.
  pub unknown_member: usize,
}

#[derive(Debug)]
pub struct BatchReport {
  pub batch_id:       Uuid,
  pub effective_date: NaiveDate,
  pub dimensions:     Vec<DimensionReport>,
  pub facts:          FactCounts,
  pub feed_rejected:  Vec<RejectedRecord>,
}

impl BatchReport {
  /// Whether any key, row or record was dropped.
  pub fn has_failures(&self) -> bool {
    !self.feed_rejected.is_empty()
      || self.facts.quarantined > 0
      || self
        .dimensions
        .iter()
        .any(|d| !d.apply.failures.is_empty() || !d.rejected.is_empty())
  }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline<S, I = SequenceIssuer> {
  store:      Arc<S>,
  issuer:     Arc<I>,
  dimensions: Vec<DimensionSchema>,
  fact:       FactSchema,
  tie_break:  TieBreak,
  workers:    usize,
}

impl<S> Pipeline<S, SequenceIssuer>
where
  S: FactStore + 'static,
{
  /// Build a pipeline from configuration, resuming surrogate key issuance
  /// after the highest key already in the store.
  pub async fn open(store: Arc<S>, config: &WarehouseConfig) -> Result<Self> {
    let last = store.max_surrogate_key().await.map_err(Error::store)?;
    let issuer = Arc::new(SequenceIssuer::resume_after(last));
    Ok(
      Self::new(store, issuer, config.dimensions.clone(), config.fact.clone())?
        .with_tie_break(config.tie_break)
        .with_workers(config.workers),
    )
  }
}

impl<S, I> Pipeline<S, I>
where
  S: FactStore + 'static,
  I: KeyIssuer + 'static,
{
  pub fn new(
    store: Arc<S>,
    issuer: Arc<I>,
    dimensions: Vec<DimensionSchema>,
    fact: FactSchema,
  ) -> Result<Self> {
    for dimension in &dimensions {
      dimension.validate()?;
    }
    fact.validate(&dimensions)?;
    Ok(Self {
      store,
      issuer,
      dimensions,
      fact,
      tie_break: TieBreak::default(),
      workers: 4,
    })
  }

  pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
    self.tie_break = tie_break;
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  pub fn store(&self) -> &S { &self.store }

  /// Run one batch through both phases.
  ///
  /// Returns an error without touching the ledger if any dimension's
  /// snapshots are ambiguous under the configured tie-break, and before the
  /// fact phase if the ledger backend fails. Keys that break an interval rule
  /// and rejected rows are reported, not raised.
  pub async fn run(&self, batch: Batch) -> Result<BatchReport> {
    let batch_id = Uuid::new_v4();
    let Batch {
      effective_date,
      dimension_rows,
      events,
      corrections,
      feed_rejected,
    } = batch;
    tracing::info!(
      %batch_id,
      %effective_date,
      dimensions = dimension_rows.len(),
      events = events.len(),
      corrections = corrections.len(),
      "starting batch"
    );

    // Phase 0: normalize everything before the first write.
    let mut normalized: Vec<NormalizedBatch> = Vec::with_capacity(dimension_rows.len());
    for (name, rows) in dimension_rows {
      let schema = self
        .dimensions
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| Error::UnknownDimension(name.clone()))?;
      let batch = Normalizer::new(schema, self.tie_break).normalize(rows)?;
      for rejected in &batch.rejected {
        tracing::warn!(
          %batch_id,
          dimension = %name,
          row = rejected.row,
          reason = %rejected.reason,
          "rejected dimension row"
        );
      }
      normalized.push(batch);
    }

    // Phase 1: dimension changes. Each apply waits for all of its workers.
    let applier = ChangeApplier::new(Arc::clone(&self.store), Arc::clone(&self.issuer))
      .with_tie_break(self.tie_break)
      .with_workers(self.workers);
    let mut dimensions = Vec::with_capacity(normalized.len());
    for batch in normalized {
      let rejected = batch.rejected.clone();
      let tie_broken = batch.tie_broken.clone();
      let apply = applier.apply(batch, effective_date).await?;
      dimensions.push(DimensionReport { apply, rejected, tie_broken });
    }

    // Phase 2: facts, resolved against the ledger as it stands now.
    let mut assembler = FactAssembler::new(self.store.as_ref(), &self.fact, batch_id);
    let mut facts = FactCounts::default();
    for event in &events {
      tally(&mut facts, assembler.assemble(event).await?);
    }
    for event in &corrections {
      tally(&mut facts, assembler.correct(event).await?);
    }

    tracing::info!(
      %batch_id,
      written = facts.written,
      corrected = facts.corrected,
      already_loaded = facts.already_loaded,
      quarantined = facts.quarantined,
      unknown_member = facts.unknown_member,
      "finished batch"
    );

    Ok(BatchReport {
      batch_id,
      effective_date,
      dimensions,
      facts,
      feed_rejected,
    })
  }
}

fn tally(counts: &mut FactCounts, outcome: Assembled) {
  match outcome {
    Assembled::Written(row) => {
      counts.written += 1;
      if !row.unknown_roles.is_empty() {
        counts.unknown_member += 1;
      }
    }
    Assembled::Corrected { replacement, .. } => {
      counts.corrected += 1;
      if !replacement.unknown_roles.is_empty() {
        counts.unknown_member += 1;
      }
    }
    Assembled::AlreadyLoaded => counts.already_loaded += 1,
    Assembled::Quarantined(_) => counts.quarantined += 1,
  }
}
