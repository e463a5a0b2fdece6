//! Point-in-time resolver.
//!
//! Answers "which version of this entity was authoritative on this date?" by
//! binary search over the key's history. Histories are fetched once per key
//! and cached, so a resolver must only live for one fact phase: it does not
//! observe ledger writes made after a key was first looked up.

use std::collections::HashMap;

use chrono::NaiveDate;
use strata_core::{
  dimension::{DimensionVersion, NaturalKey, SurrogateKey, version_containing},
  ledger::VersionLedger,
};

use crate::error::{Error, Result};

pub struct Resolver<'a, L> {
  ledger: &'a L,
  cache:  HashMap<(String, NaturalKey), Vec<DimensionVersion>>,
}

impl<'a, L: VersionLedger> Resolver<'a, L> {
  pub fn new(ledger: &'a L) -> Self { Self { ledger, cache: HashMap::new() } }

  /// The surrogate key of the version of `natural_key` valid at `at`.
  ///
  /// Fails with [`strata_core::Error::UnresolvedReference`] when the key was
  /// never seen or `at` lies outside every recorded interval.
  pub async fn resolve(
    &mut self,
    dimension: &str,
    natural_key: &NaturalKey,
    at: NaiveDate,
  ) -> Result<SurrogateKey> {
    self
      .version(dimension, natural_key, at)
      .await?
      .map(|v| v.surrogate_key)
      .ok_or_else(|| {
        strata_core::Error::UnresolvedReference {
          dimension:   dimension.to_owned(),
          natural_key: natural_key.clone(),
          at,
        }
        .into()
      })
  }

  /// The full version valid at `at`, if any.
  pub async fn version(
    &mut self,
    dimension: &str,
    natural_key: &NaturalKey,
    at: NaiveDate,
  ) -> Result<Option<&DimensionVersion>> {
    let cache_key = (dimension.to_owned(), natural_key.clone());
    if !self.cache.contains_key(&cache_key) {
      let history = self
        .ledger
        .history(dimension, natural_key)
        .await
        .map_err(Error::store)?;
      self.cache.insert(cache_key.clone(), history);
    }

    Ok(
      self
        .cache
        .get(&cache_key)
        .and_then(|history| version_containing(history, at)),
    )
  }

  /// Number of histories currently cached.
  pub fn cached(&self) -> usize { self.cache.len() }
}

#[cfg(test)]
mod tests {
  use strata_core::{
    dimension::{AttrValue, Attributes, NewVersion},
    memory::MemoryStore,
  };

  use super::*;

  fn d(s: &str) -> NaiveDate { s.parse().unwrap() }

  async fn ledger() -> MemoryStore {
    let store = MemoryStore::new();
    let new = |sk: i64, category: &str, from: &str| NewVersion {
      surrogate_key: SurrogateKey(sk),
      dimension:     "product".into(),
      natural_key:   "P1".into(),
      attributes:    Attributes::new().with("category", AttrValue::text(category)),
      valid_from:    d(from),
    };
    store.append(new(1, "Tech", "2023-01-01")).await.unwrap();
    store
      .supersede(SurrogateKey(1), d("2023-06-01"), new(2, "Office", "2023-06-01"))
      .await
      .unwrap();
    store
  }

  #[tokio::test]
  async fn resolves_to_the_version_valid_at_the_date() {
    let store = ledger().await;
    let mut resolver = Resolver::new(&store);
    let p1: NaturalKey = "P1".into();

    assert_eq!(resolver.resolve("product", &p1, d("2023-03-01")).await.unwrap(), SurrogateKey(1));
    assert_eq!(resolver.resolve("product", &p1, d("2023-05-31")).await.unwrap(), SurrogateKey(1));
    assert_eq!(resolver.resolve("product", &p1, d("2023-06-01")).await.unwrap(), SurrogateKey(2));
    assert_eq!(resolver.resolve("product", &p1, d("2023-09-01")).await.unwrap(), SurrogateKey(2));
    assert_eq!(resolver.cached(), 1);
  }

  #[tokio::test]
  async fn unknown_key_or_date_before_first_sighting_is_unresolved() {
    let store = ledger().await;
    let mut resolver = Resolver::new(&store);

    for (key, at) in [("P9", "2023-03-01"), ("P1", "2022-12-31")] {
      let err = resolver.resolve("product", &key.into(), d(at)).await.unwrap_err();
      assert!(matches!(
        err,
        Error::Core(strata_core::Error::UnresolvedReference { .. })
      ));
    }
  }

  #[tokio::test]
  async fn dimensions_are_resolved_independently() {
    let store = ledger().await;
    let mut resolver = Resolver::new(&store);
    assert!(resolver.resolve("customer", &"P1".into(), d("2023-03-01")).await.is_err());
    assert!(resolver.resolve("product", &"P1".into(), d("2023-03-01")).await.is_ok());
  }
}
