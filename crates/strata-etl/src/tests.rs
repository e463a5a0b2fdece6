//! Whole-batch scenarios, mostly against the in-memory store.

use std::sync::Arc;

use chrono::NaiveDate;
use strata_core::{
  dimension::{AttrValue, DimensionVersion, NaturalKey, NewVersion, SurrogateKey},
  fact::{FactEvent, FactRow, QuarantinedEvent, RowKind},
  issuer::SequenceIssuer,
  ledger::{FactStore, LedgerError, VersionLedger},
  memory::MemoryStore,
  schema::{AttributeSpec, DimensionSchema, FactSchema, RoleSpec, UnresolvedPolicy},
  snapshot::{RawRow, TieBreak},
};
use strata_store_sqlite::SqliteStore;
use uuid::Uuid;

use crate::{Batch, Error, Pipeline, WarehouseConfig};

fn d(s: &str) -> NaiveDate { s.parse().unwrap() }

fn dimensions() -> Vec<DimensionSchema> {
  let text = |name: &str| AttributeSpec {
    name:     name.into(),
    kind:     Default::default(),
    required: false,
  };
  vec![
    DimensionSchema { name: "customer".into(), attributes: vec![text("segment")] },
    DimensionSchema { name: "product".into(), attributes: vec![text("category")] },
  ]
}

fn fact(policy: UnresolvedPolicy) -> FactSchema {
  FactSchema {
    name:     "sales".into(),
    roles:    vec![RoleSpec {
      name:          "product".into(),
      dimension:     "product".into(),
      on_unresolved: policy,
    }],
    measures: vec!["sales".into()],
  }
}

fn pipeline(policy: UnresolvedPolicy) -> Pipeline<MemoryStore> {
  Pipeline::new(
    Arc::new(MemoryStore::new()),
    Arc::new(SequenceIssuer::new()),
    dimensions(),
    fact(policy),
  )
  .unwrap()
}

fn products(at: &str, rows: &[(&str, &str)]) -> Batch {
  let mut batch = Batch::new(d(at));
  batch.dimension_rows.insert(
    "product".into(),
    rows
      .iter()
      .map(|(key, category)| RawRow::new(*key).field("category", *category))
      .collect(),
  );
  batch
}

fn sale(order: &str, product: &str, at: &str, sales: f64) -> FactEvent {
  FactEvent::new(order, 1)
    .with_role("product", product, d(at))
    .with_measure("sales", sales)
}

async fn category(store: &MemoryStore, sk: SurrogateKey) -> Option<AttrValue> {
  store
    .history("product", &NaturalKey::from("P1"))
    .await
    .unwrap()
    .into_iter()
    .find(|v| v.surrogate_key == sk)
    .and_then(|v| v.attributes.get("category").cloned())
}

// ─── Versioning ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn category_change_versions_and_facts_resolve_by_date() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);

  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  let report = p.run(products("2023-06-01", &[("P1", "Office")])).await.unwrap();
  assert_eq!(report.dimensions[0].apply.superseded, 1);

  let history = p
    .store()
    .history("product", &NaturalKey::from("P1"))
    .await
    .unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].valid_from, d("2023-01-01"));
  assert_eq!(history[0].valid_to, Some(d("2023-06-01")));
  assert_eq!(history[1].valid_from, d("2023-06-01"));
  assert!(history[1].is_current());

  let mut batch = Batch::new(d("2023-09-10"));
  batch.events = vec![
    sale("CA-1", "P1", "2023-03-01", 10.0),
    sale("CA-2", "P1", "2023-09-01", 20.0),
  ];
  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.written, 2);

  let march = &p.store().fact_rows("CA-1", 1).await.unwrap()[0];
  let september = &p.store().fact_rows("CA-2", 1).await.unwrap()[0];
  assert_eq!(march.keys["product"], history[0].surrogate_key);
  assert_eq!(september.keys["product"], history[1].surrogate_key);
  assert_eq!(
    category(p.store(), march.keys["product"]).await,
    Some(AttrValue::text("Tech"))
  );
}

#[tokio::test]
async fn rerunning_an_earlier_batch_changes_nothing() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  p.run(products("2023-06-01", &[("P1", "Office")])).await.unwrap();

  let first = p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  let second = p.run(products("2023-06-01", &[("P1", "Office")])).await.unwrap();

  assert_eq!(first.dimensions[0].apply.unchanged, 1);
  assert_eq!(second.dimensions[0].apply.unchanged, 1);
  assert!(!first.has_failures());
  let history = p
    .store()
    .history("product", &NaturalKey::from("P1"))
    .await
    .unwrap();
  assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn events_reloaded_in_a_later_batch_are_not_duplicated() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = products("2023-01-01", &[("P1", "Tech")]);
  batch.events = vec![sale("CA-1", "P1", "2023-03-01", 10.0)];

  p.run(batch.clone()).await.unwrap();
  let report = p.run(batch).await.unwrap();

  assert_eq!(report.facts.written, 0);
  assert_eq!(report.facts.already_loaded, 1);
  assert_eq!(p.store().fact_rows("CA-1", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_day_replacement_under_last_row_wins() {
  let p = pipeline(UnresolvedPolicy::UnknownMember).with_tie_break(TieBreak::LastRowWins);
  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  let report = p.run(products("2023-01-01", &[("P1", "Office")])).await.unwrap();
  assert_eq!(report.dimensions[0].apply.superseded, 1);

  let history = p
    .store()
    .history("product", &NaturalKey::from("P1"))
    .await
    .unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].valid_to, Some(d("2023-01-01")));

  let at = p
    .store()
    .version_at("product", &NaturalKey::from("P1"), d("2023-01-01"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(at.attributes.get("category"), Some(&AttrValue::text("Office")));
}

#[tokio::test]
async fn same_day_conflict_is_rejected_by_default() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  let report = p.run(products("2023-01-01", &[("P1", "Office")])).await.unwrap();

  let failures = &report.dimensions[0].apply.failures;
  assert_eq!(failures.len(), 1);
  assert!(matches!(failures[0].error, strata_core::Error::AmbiguousSnapshot { .. }));
}

// ─── Failure handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn ambiguous_batch_aborts_before_any_write() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = products("2023-01-01", &[("P1", "Tech"), ("P1", "Office")]);
  batch
    .dimension_rows
    .insert("customer".into(), vec![RawRow::new("C1").field("segment", "Consumer")]);
  batch.events = vec![sale("CA-1", "P1", "2023-01-02", 1.0)];

  let err = p.run(batch).await.unwrap_err();
  assert!(matches!(err, Error::Core(strata_core::Error::AmbiguousSnapshot { .. })));

  assert!(
    p.store()
      .history("customer", &NaturalKey::from("C1"))
      .await
      .unwrap()
      .is_empty()
  );
  assert_eq!(p.store().max_surrogate_key().await.unwrap(), None);
  assert!(p.store().fact_rows("CA-1", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn one_failing_key_does_not_block_the_others() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  p.run(products("2023-06-01", &[("P1", "Tech")])).await.unwrap();

  // Backfilling a different category before P1's first version conflicts.
  let report = p
    .run(products("2023-03-01", &[("P1", "Office"), ("P2", "Furniture")]))
    .await
    .unwrap();

  let apply = &report.dimensions[0].apply;
  assert_eq!(apply.inserted, 1);
  assert_eq!(apply.failures.len(), 1);
  assert_eq!(apply.failures[0].natural_key, NaturalKey::from("P1"));
  assert!(matches!(apply.failures[0].error, strata_core::Error::Overlap { .. }));
  assert!(report.has_failures());

  assert!(
    p.store()
      .current_version("product", &NaturalKey::from("P2"))
      .await
      .unwrap()
      .is_some()
  );
}

#[tokio::test]
async fn unknown_dimension_fails_the_batch() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = Batch::new(d("2023-01-01"));
  batch.dimension_rows.insert("store".into(), vec![RawRow::new("S1")]);

  let err = p.run(batch).await.unwrap_err();
  assert!(matches!(err, Error::UnknownDimension(name) if name == "store"));
}

#[tokio::test]
async fn rejected_rows_are_reported() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = products("2023-01-01", &[("P1", "Tech")]);
  batch
    .dimension_rows
    .get_mut("product")
    .unwrap()
    .push(RawRow::new("  ").field("category", "Tech"));

  let report = p.run(batch).await.unwrap();
  assert_eq!(report.dimensions[0].rejected.len(), 1);
  assert_eq!(report.dimensions[0].apply.inserted, 1);
  assert!(report.has_failures());
}

// ─── Facts ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn never_seen_product_maps_to_the_unknown_member() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = products("2023-01-01", &[("P1", "Tech")]);
  batch.events = vec![sale("CA-9", "P9", "2023-03-01", 5.0)];

  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.written, 1);
  assert_eq!(report.facts.unknown_member, 1);

  let row = &p.store().fact_rows("CA-9", 1).await.unwrap()[0];
  assert_eq!(row.keys["product"], SurrogateKey::UNKNOWN);
  assert_eq!(row.unknown_roles, vec!["product"]);
}

#[tokio::test]
async fn never_seen_product_is_quarantined_when_configured() {
  let p = pipeline(UnresolvedPolicy::Quarantine);
  let mut batch = products("2023-01-01", &[("P1", "Tech")]);
  batch.events = vec![
    sale("CA-1", "P1", "2023-03-01", 10.0),
    sale("CA-9", "P9", "2023-03-01", 5.0),
  ];

  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.written, 1);
  assert_eq!(report.facts.quarantined, 1);

  let quarantined = p.store().quarantined(Some(report.batch_id)).await.unwrap();
  assert_eq!(quarantined.len(), 1);
  assert_eq!(quarantined[0].event.order_id, "CA-9");
}

#[tokio::test]
async fn facts_resolve_against_versions_opened_in_the_same_batch() {
  let p = pipeline(UnresolvedPolicy::Quarantine);
  let mut batch = products("2023-01-01", &[("P1", "Tech")]);
  batch.events = vec![sale("CA-1", "P1", "2023-01-01", 10.0)];

  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.written, 1);
  assert_eq!(report.facts.quarantined, 0);
}

#[tokio::test]
async fn event_dated_before_first_version_is_unresolved() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  let mut batch = products("2023-06-01", &[("P1", "Tech")]);
  batch.events = vec![sale("CA-1", "P1", "2023-05-31", 10.0)];

  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.unknown_member, 1);
}

#[tokio::test]
async fn corrections_reverse_and_replace() {
  let p = pipeline(UnresolvedPolicy::UnknownMember);
  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  p.run(products("2023-06-01", &[("P1", "Office")])).await.unwrap();

  let mut batch = Batch::new(d("2023-06-01"));
  batch.events = vec![sale("CA-1", "P1", "2023-03-01", 10.0)];
  p.run(batch).await.unwrap();

  let mut batch = Batch::new(d("2023-06-01"));
  batch.corrections = vec![sale("CA-1", "P1", "2023-07-01", 15.0)];
  let report = p.run(batch.clone()).await.unwrap();
  assert_eq!(report.facts.corrected, 1);

  let rows = p.store().fact_rows("CA-1", 1).await.unwrap();
  let kinds: Vec<RowKind> = rows.iter().map(|r| r.kind).collect();
  assert_eq!(kinds, [RowKind::Original, RowKind::Reversal, RowKind::Replacement]);
  assert_eq!(rows[0].keys, rows[1].keys);
  assert_ne!(rows[2].keys["product"], rows[0].keys["product"]);
  let net: f64 = rows.iter().map(|r| r.measures["sales"]).sum();
  assert_eq!(net, 15.0);

  // Replaying the same correction writes nothing further.
  let report = p.run(batch).await.unwrap();
  assert_eq!(report.facts.already_loaded, 1);
  assert_eq!(p.store().fact_rows("CA-1", 1).await.unwrap().len(), 3);
}

/// `MemoryStore` whose ledger reads fail for one natural key.
struct FlakyStore {
  inner:  MemoryStore,
  broken: NaturalKey,
}

#[derive(Debug, thiserror::Error)]
enum FlakyError {
  #[error(transparent)]
  Rule(#[from] strata_core::Error),
  #[error("disk I/O error")]
  Io,
}

impl LedgerError for FlakyError {
  fn into_core(self) -> std::result::Result<strata_core::Error, Self> {
    match self {
      Self::Rule(e) => Ok(e),
      other => Err(other),
    }
  }
}

type Flaky<T> = std::result::Result<T, FlakyError>;

impl VersionLedger for FlakyStore {
  type Error = FlakyError;

  async fn current_version(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Flaky<Option<DimensionVersion>> {
    if *natural_key == self.broken {
      return Err(FlakyError::Io);
    }
    Ok(self.inner.current_version(dimension, natural_key).await?)
  }

  async fn append(&self, version: NewVersion) -> Flaky<DimensionVersion> {
    Ok(self.inner.append(version).await?)
  }

  async fn close(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
  ) -> Flaky<DimensionVersion> {
    Ok(self.inner.close(surrogate_key, valid_to).await?)
  }

  async fn supersede(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
    replacement: NewVersion,
  ) -> Flaky<(DimensionVersion, DimensionVersion)> {
    Ok(self.inner.supersede(surrogate_key, valid_to, replacement).await?)
  }

  async fn version_at(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
    at: NaiveDate,
  ) -> Flaky<Option<DimensionVersion>> {
    if *natural_key == self.broken {
      return Err(FlakyError::Io);
    }
    Ok(self.inner.version_at(dimension, natural_key, at).await?)
  }

  async fn history(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Flaky<Vec<DimensionVersion>> {
    Ok(self.inner.history(dimension, natural_key).await?)
  }

  async fn max_surrogate_key(&self) -> Flaky<Option<SurrogateKey>> {
    Ok(self.inner.max_surrogate_key().await?)
  }
}

impl FactStore for FlakyStore {
  async fn append_fact(&self, row: FactRow) -> Flaky<bool> {
    Ok(self.inner.append_fact(row).await?)
  }

  async fn fact_rows(&self, order_id: &str, line: u32) -> Flaky<Vec<FactRow>> {
    Ok(self.inner.fact_rows(order_id, line).await?)
  }

  async fn quarantine(&self, entry: QuarantinedEvent) -> Flaky<()> {
    Ok(self.inner.quarantine(entry).await?)
  }

  async fn quarantined(&self, batch_id: Option<Uuid>) -> Flaky<Vec<QuarantinedEvent>> {
    Ok(self.inner.quarantined(batch_id).await?)
  }
}

#[tokio::test]
async fn ledger_failure_aborts_the_batch_before_any_fact() {
  let store = Arc::new(FlakyStore {
    inner:  MemoryStore::new(),
    broken: NaturalKey::from("P2"),
  });
  let p = Pipeline::new(
    Arc::clone(&store),
    Arc::new(SequenceIssuer::new()),
    dimensions(),
    fact(UnresolvedPolicy::UnknownMember),
  )
  .unwrap();

  let mut batch = products("2023-01-01", &[("P1", "Tech"), ("P2", "Office")]);
  batch.events = vec![sale("CA-1", "P2", "2023-01-01", 10.0)];

  let err = p.run(batch).await.unwrap_err();
  assert!(matches!(err, Error::Store(_)), "got {err:?}");
  assert!(store.inner.fact_rows("CA-1", 1).await.unwrap().is_empty());
  assert!(store.inner.quarantined(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn rerunning_a_quarantining_batch_keeps_one_entry_per_line() {
  let p = pipeline(UnresolvedPolicy::Quarantine);
  let mut batch = Batch::new(d("2023-03-01"));
  batch.events = vec![sale("CA-9", "P9", "2023-03-01", 5.0)];

  let first = p.run(batch.clone()).await.unwrap();
  let second = p.run(batch).await.unwrap();
  assert_eq!(second.facts.quarantined, 1);

  let entries = p.store().quarantined(None).await.unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].batch_id, second.batch_id);
  assert!(p.store().quarantined(Some(first.batch_id)).await.unwrap().is_empty());
}

// ─── SQLite backend ──────────────────────────────────────────────────────────

#[tokio::test]
async fn category_change_and_rerun_on_sqlite() {
  let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
  let p = Pipeline::new(
    Arc::clone(&store),
    Arc::new(SequenceIssuer::new()),
    dimensions(),
    fact(UnresolvedPolicy::UnknownMember),
  )
  .unwrap();

  p.run(products("2023-01-01", &[("P1", "Tech")])).await.unwrap();
  let changed = products("2023-06-01", &[("P1", "Office")]);
  let report = p.run(changed.clone()).await.unwrap();
  assert_eq!(report.dimensions[0].apply.superseded, 1);

  let rerun = p.run(changed).await.unwrap();
  assert_eq!(rerun.dimensions[0].apply.unchanged, 1);
  assert_eq!(rerun.dimensions[0].apply.superseded, 0);

  let history = store.history("product", &NaturalKey::from("P1")).await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].valid_to, Some(d("2023-06-01")));
  assert!(history[1].is_current());

  let mut batch = Batch::new(d("2023-09-10"));
  batch.events = vec![
    sale("CA-1", "P1", "2023-03-01", 10.0),
    sale("CA-2", "P1", "2023-09-01", 20.0),
  ];
  let report = p.run(batch.clone()).await.unwrap();
  assert_eq!(report.facts.written, 2);

  let march = &store.fact_rows("CA-1", 1).await.unwrap()[0];
  let september = &store.fact_rows("CA-2", 1).await.unwrap()[0];
  assert_eq!(march.keys["product"], history[0].surrogate_key);
  assert_eq!(september.keys["product"], history[1].surrogate_key);

  let again = p.run(batch).await.unwrap();
  assert_eq!(again.facts.already_loaded, 2);
}

// ─── Configuration and feeds ─────────────────────────────────────────────────

const CONFIG: &str = r#"
store_path = "warehouse.db"
workers    = 2

[[dimensions]]
name = "customer"
attributes = [{ name = "segment", required = true }]

[[dimensions]]
name = "product"
attributes = [{ name = "category", required = true }]

[fact]
name     = "sales"
measures = ["sales", "profit", "processing_days", "sla_days", "is_late", "profit_margin"]
roles = [
  { name = "customer", dimension = "customer" },
  { name = "product", dimension = "product" },
]

[feed]
order_id_column = "Order ID"
measures = { sales = "Sales", profit = "Profit" }
dimensions = [
  { dimension = "customer", key_column = "Customer ID", attributes = { segment = "Segment" } },
  { dimension = "product", key_column = "Product ID", attributes = { category = "Category" } },
]
roles = [
  { role = "customer", key_column = "Customer ID", date_column = "Order Date" },
  { role = "product", key_column = "Product ID", date_column = "Order Date" },
]
lead_time = { order_date_column = "Order Date", ship_date_column = "Ship Date", ship_mode_column = "Ship Mode" }
margin = { profit_column = "Profit", sales_column = "Sales" }
"#;

const FEED: &str = "\
Order ID,Order Date,Ship Date,Ship Mode,Customer ID,Segment,Product ID,Category,Sales,Profit
CA-1,01/03/2023,07/03/2023,Second Class,C1,Consumer,P1,Technology,100,20
CA-1,01/03/2023,03/03/2023,Same Day,C1,Consumer,P2,Furniture,50,-5
CA-2,02/03/2023,09/03/2023,Standard Class,C2,Corporate,P1,Technology,0,0
CA-3,,09/03/2023,Standard Class,C2,Corporate,P1,Technology,10,1
";

#[tokio::test]
async fn feed_loads_end_to_end() {
  let cfg = WarehouseConfig::from_toml(CONFIG).unwrap();
  let split = strata_feed::split(FEED, &cfg.feed).unwrap();
  assert_eq!(split.rejected.len(), 1);

  let p = Pipeline::open(Arc::new(MemoryStore::new()), &cfg).await.unwrap();
  let report = p.run(Batch::from_feed(d("2023-03-01"), split)).await.unwrap();

  let inserted: usize = report.dimensions.iter().map(|r| r.apply.inserted).sum();
  assert_eq!(inserted, 4);
  assert_eq!(report.facts.written, 3);
  assert_eq!(report.facts.unknown_member, 0);
  assert_eq!(report.feed_rejected.len(), 1);

  let first = p.store().fact_rows("CA-1", 1).await.unwrap();
  let second = p.store().fact_rows("CA-1", 2).await.unwrap();
  assert_eq!(first[0].measures["processing_days"], 6.0);
  assert_eq!(first[0].measures["is_late"], 1.0);
  assert_eq!(first[0].measures["profit_margin"], 0.2);
  assert_eq!(second[0].measures["is_late"], 1.0);
  assert!(!first[0].keys["product"].is_unknown());
  assert_ne!(first[0].keys["product"], second[0].keys["product"]);

  let zero_sales = &p.store().fact_rows("CA-2", 1).await.unwrap()[0];
  assert!(!zero_sales.measures.contains_key("profit_margin"));
}

#[tokio::test]
async fn reopened_pipeline_resumes_surrogate_keys() {
  let cfg = WarehouseConfig::from_toml(CONFIG).unwrap();
  let store = Arc::new(MemoryStore::new());

  let first = Pipeline::open(Arc::clone(&store), &cfg).await.unwrap();
  let mut batch = Batch::new(d("2023-01-01"));
  batch.dimension_rows.insert("product".into(), vec![
    RawRow::new("P1").field("category", "Tech"),
    RawRow::new("P2").field("category", "Office"),
  ]);
  first.run(batch).await.unwrap();
  drop(first);

  let second = Pipeline::open(Arc::clone(&store), &cfg).await.unwrap();
  let mut batch = Batch::new(d("2023-02-01"));
  batch
    .dimension_rows
    .insert("product".into(), vec![RawRow::new("P3").field("category", "Tech")]);
  second.run(batch).await.unwrap();

  let p3 = store
    .current_version("product", &NaturalKey::from("P3"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(p3.surrogate_key, SurrogateKey(3));
}
