//! [`MemoryStore`]: an in-process implementation of [`VersionLedger`] and
//! [`FactStore`].
//!
//! Every operation takes the lock once, so a supersession is observed
//! atomically by concurrent readers. Used by tests and by callers that do not
//! need durability.

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
  Error, Result,
  dimension::{
    DimensionVersion, NaturalKey, NewVersion, SurrogateKey, chronological,
    version_containing,
  },
  fact::{FactRow, QuarantinedEvent},
  ledger::{FactStore, VersionLedger, check_append, check_close, plan_supersede},
};

type ChainKey = (String, NaturalKey);

#[derive(Default)]
struct Inner {
  chains:     HashMap<ChainKey, Vec<DimensionVersion>>,
  /// Surrogate key → owning chain.
  owners:     HashMap<SurrogateKey, ChainKey>,
  facts:      BTreeMap<(String, u32, u32), FactRow>,
  quarantine: Vec<QuarantinedEvent>,
}

impl Inner {
  fn chain(&self, dimension: &str, natural_key: &NaturalKey) -> &[DimensionVersion] {
    self
      .chains
      .get(&(dimension.to_owned(), natural_key.clone()))
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  fn push(&mut self, version: DimensionVersion) {
    let key = (version.dimension.clone(), version.natural_key.clone());
    self.owners.insert(version.surrogate_key, key.clone());
    let chain = self.chains.entry(key).or_default();
    chain.push(version);
    chain.sort_by(chronological);
  }

  fn owner_chain_mut(
    &mut self,
    surrogate_key: SurrogateKey,
  ) -> Result<&mut Vec<DimensionVersion>> {
    let key = self
      .owners
      .get(&surrogate_key)
      .ok_or(Error::VersionNotFound(surrogate_key))?;
    self
      .chains
      .get_mut(key)
      .ok_or(Error::VersionNotFound(surrogate_key))
  }
}

/// Thread-safe in-memory warehouse. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }
}

impl VersionLedger for MemoryStore {
  type Error = Error;

  async fn current_version(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Result<Option<DimensionVersion>> {
    let inner = self.inner.read();
    Ok(
      inner
        .chain(dimension, natural_key)
        .iter()
        .find(|v| v.is_current())
        .cloned(),
    )
  }

  async fn append(&self, version: NewVersion) -> Result<DimensionVersion> {
    let mut inner = self.inner.write();
    check_append(inner.chain(&version.dimension, &version.natural_key), &version)?;
    if inner.owners.contains_key(&version.surrogate_key) {
      return Err(Error::DuplicateSurrogateKey(version.surrogate_key));
    }

    let stored = version.into_version(Utc::now());
    inner.push(stored.clone());
    Ok(stored)
  }

  async fn close(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
  ) -> Result<DimensionVersion> {
    let mut inner = self.inner.write();
    let chain = inner.owner_chain_mut(surrogate_key)?;
    let version = chain
      .iter_mut()
      .find(|v| v.surrogate_key == surrogate_key)
      .ok_or(Error::VersionNotFound(surrogate_key))?;

    check_close(version, valid_to)?;
    version.valid_to = Some(valid_to);
    let closed = version.clone();
    chain.sort_by(chronological);
    Ok(closed)
  }

  async fn supersede(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
    replacement: NewVersion,
  ) -> Result<(DimensionVersion, DimensionVersion)> {
    let mut inner = self.inner.write();
    if inner.owners.contains_key(&replacement.surrogate_key) {
      return Err(Error::DuplicateSurrogateKey(replacement.surrogate_key));
    }

    let chain = inner.owner_chain_mut(surrogate_key)?;
    let closed = plan_supersede(chain, surrogate_key, valid_to, &replacement)?;
    if let Some(slot) = chain.iter_mut().find(|v| v.surrogate_key == surrogate_key) {
      *slot = closed.clone();
    }

    let opened = replacement.into_version(Utc::now());
    inner.push(opened.clone());
    Ok((closed, opened))
  }

  async fn version_at(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
    at: NaiveDate,
  ) -> Result<Option<DimensionVersion>> {
    let inner = self.inner.read();
    Ok(version_containing(inner.chain(dimension, natural_key), at).cloned())
  }

  async fn history(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Result<Vec<DimensionVersion>> {
    Ok(self.inner.read().chain(dimension, natural_key).to_vec())
  }

  async fn max_surrogate_key(&self) -> Result<Option<SurrogateKey>> {
    Ok(self.inner.read().owners.keys().max().copied())
  }
}

impl FactStore for MemoryStore {
  async fn append_fact(&self, row: FactRow) -> Result<bool> {
    let mut inner = self.inner.write();
    let id = (row.order_id.clone(), row.line, row.revision);
    if inner.facts.contains_key(&id) {
      return Ok(false);
    }
    inner.facts.insert(id, row);
    Ok(true)
  }

  async fn fact_rows(&self, order_id: &str, line: u32) -> Result<Vec<FactRow>> {
    let inner = self.inner.read();
    let start = (order_id.to_owned(), line, 0);
    let end = (order_id.to_owned(), line, u32::MAX);
    Ok(inner.facts.range(start..=end).map(|(_, row)| row.clone()).collect())
  }

  async fn quarantine(&self, entry: QuarantinedEvent) -> Result<()> {
    let mut inner = self.inner.write();
    inner.quarantine.retain(|q| {
      q.event.order_id != entry.event.order_id || q.event.line != entry.event.line
    });
    inner.quarantine.push(entry);
    Ok(())
  }

  async fn quarantined(&self, batch_id: Option<Uuid>) -> Result<Vec<QuarantinedEvent>> {
    let inner = self.inner.read();
    Ok(
      inner
        .quarantine
        .iter()
        .filter(|q| batch_id.is_none_or(|id| q.batch_id == id))
        .cloned()
        .collect(),
    )
  }
}
