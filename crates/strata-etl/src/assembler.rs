//! Fact assembler: fact events → immutable fact rows.
//!
//! Every role declared in the fact schema is resolved independently with the
//! event's own date for that role. The resulting row freezes the surrogate
//! keys it resolved to; later dimension changes never touch it. Corrections
//! append a reversal of the latest row followed by a freshly resolved
//! replacement.

use std::collections::BTreeMap;

use chrono::Utc;
use strata_core::{
  dimension::SurrogateKey,
  fact::{FactEvent, FactRow, QuarantinedEvent, RowKind},
  ledger::FactStore,
  schema::{FactSchema, UnresolvedPolicy},
};
use uuid::Uuid;

use crate::{
  error::{Error, Result},
  resolver::Resolver,
};

/// Outcome of assembling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
  Written(FactRow),
  Corrected {
    reversal:    FactRow,
    replacement: FactRow,
  },
  /// The order line is already stored with the same content.
  AlreadyLoaded,
  /// Diverted to the quarantine stream for these reasons.
  Quarantined(Vec<String>),
}

/// Role keys an event resolved to, before a revision is assigned.
struct Resolved {
  keys:          BTreeMap<String, SurrogateKey>,
  unknown_roles: Vec<String>,
}

pub struct FactAssembler<'a, S> {
  store:    &'a S,
  schema:   &'a FactSchema,
  resolver: Resolver<'a, S>,
  batch_id: Uuid,
}

impl<'a, S: FactStore> FactAssembler<'a, S> {
  pub fn new(store: &'a S, schema: &'a FactSchema, batch_id: Uuid) -> Self {
    Self { store, schema, resolver: Resolver::new(store), batch_id }
  }

  /// Resolve and persist a first-time event. Loading an order line that
  /// already has rows is a no-op.
  pub async fn assemble(&mut self, event: &FactEvent) -> Result<Assembled> {
    let existing = self
      .store
      .fact_rows(&event.order_id, event.line)
      .await
      .map_err(Error::store)?;
    if !existing.is_empty() {
      return Ok(Assembled::AlreadyLoaded);
    }

    let resolved = match self.resolve_roles(event).await? {
      Ok(resolved) => resolved,
      Err(reasons) => return self.quarantine(event, reasons).await,
    };

    let row = self.row(event, 0, RowKind::Original, resolved);
    let inserted = self
      .store
      .append_fact(row.clone())
      .await
      .map_err(Error::store)?;
    Ok(if inserted { Assembled::Written(row) } else { Assembled::AlreadyLoaded })
  }

  /// Replace the stored content of an order line with `event`.
  ///
  /// Appends a reversal of the latest row (negated measures, original keys)
  /// and a replacement resolved afresh. A correction identical to what is
  /// stored is a no-op; a line with no rows yet is loaded as an original.
  pub async fn correct(&mut self, event: &FactEvent) -> Result<Assembled> {
    let existing = self
      .store
      .fact_rows(&event.order_id, event.line)
      .await
      .map_err(Error::store)?;
    let Some(latest) = existing.last().cloned() else {
      return self.assemble(event).await;
    };

    let resolved = match self.resolve_roles(event).await? {
      Ok(resolved) => resolved,
      Err(reasons) => return self.quarantine(event, reasons).await,
    };

    if !latest.is_reversal()
      && latest.keys == resolved.keys
      && latest.measures == event.measures
    {
      return Ok(Assembled::AlreadyLoaded);
    }

    // An interrupted correction may have left a reversal as the latest row.
    let (reversal, next) = if latest.is_reversal() {
      (None, latest.revision + 1)
    } else {
      let reversal = FactRow {
        revision: latest.revision + 1,
        kind: RowKind::Reversal,
        measures: latest.measures.iter().map(|(k, v)| (k.clone(), -v)).collect(),
        batch_id: self.batch_id,
        recorded_at: Utc::now(),
        ..latest.clone()
      };
      (Some(reversal), latest.revision + 2)
    };

    if let Some(reversal) = &reversal {
      self
        .store
        .append_fact(reversal.clone())
        .await
        .map_err(Error::store)?;
    }

    let replacement = self.row(event, next, RowKind::Replacement, resolved);
    self
      .store
      .append_fact(replacement.clone())
      .await
      .map_err(Error::store)?;

    tracing::debug!(
      order_id = %event.order_id,
      line = event.line,
      revision = replacement.revision,
      "corrected fact"
    );
    Ok(Assembled::Corrected {
      reversal: reversal.unwrap_or_else(|| latest.clone()),
      replacement,
    })
  }

  /// Resolve every schema role. The inner `Err` carries quarantine reasons.
  async fn resolve_roles(
    &mut self,
    event: &FactEvent,
  ) -> Result<Result<Resolved, Vec<String>>> {
    for role in event.roles.keys() {
      if self.schema.role(role).is_none() {
        tracing::warn!(order_id = %event.order_id, role = %role, "event role not in fact schema; ignored");
      }
    }

    let mut keys = BTreeMap::new();
    let mut unknown_roles = Vec::new();
    let mut reasons = Vec::new();

    for role in &self.schema.roles {
      let outcome = match event.roles.get(&role.name) {
        None => Err(format!("role {} is missing from the event", role.name)),
        Some(r) => match self.resolver.resolve(&role.dimension, &r.natural_key, r.at).await {
          Ok(key) => Ok(key),
          Err(Error::Core(e @ strata_core::Error::UnresolvedReference { .. })) => {
            Err(format!("role {}: {e}", role.name))
          }
          Err(e) => return Err(e),
        },
      };

      match (outcome, role.on_unresolved) {
        (Ok(key), _) => {
          keys.insert(role.name.clone(), key);
        }
        (Err(_), UnresolvedPolicy::UnknownMember) => {
          keys.insert(role.name.clone(), SurrogateKey::UNKNOWN);
          unknown_roles.push(role.name.clone());
        }
        (Err(reason), UnresolvedPolicy::Quarantine) => reasons.push(reason),
      }
    }

    if reasons.is_empty() {
      Ok(Ok(Resolved { keys, unknown_roles }))
    } else {
      Ok(Err(reasons))
    }
  }

  async fn quarantine(&self, event: &FactEvent, reasons: Vec<String>) -> Result<Assembled> {
    tracing::warn!(
      order_id = %event.order_id,
      line = event.line,
      reasons = ?reasons,
      "quarantined fact event"
    );
    self
      .store
      .quarantine(QuarantinedEvent {
        event:       event.clone(),
        reasons:     reasons.clone(),
        batch_id:    self.batch_id,
        recorded_at: Utc::now(),
      })
      .await
      .map_err(Error::store)?;
    Ok(Assembled::Quarantined(reasons))
  }

  fn row(&self, event: &FactEvent, revision: u32, kind: RowKind, resolved: Resolved) -> FactRow {
    FactRow {
      order_id: event.order_id.clone(),
      line: event.line,
      revision,
      kind,
      keys: resolved.keys,
      measures: event.measures.clone(),
      unknown_roles: resolved.unknown_roles,
      batch_id: self.batch_id,
      recorded_at: Utc::now(),
    }
  }
}
