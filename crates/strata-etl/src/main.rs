//! `strata`: load order-line feeds into the warehouse and inspect history.
//!
//! Reads `strata.toml` (or the path given with `--config`) and opens the
//! SQLite warehouse it names.
//!
//! ```text
//! strata load --feed orders.csv --effective-date 2023-06-01
//! strata history --dimension product --key P1
//! strata resolve --dimension product --key P1 --at 2023-03-01
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use strata_core::{dimension::NaturalKey, ledger::{FactStore, VersionLedger}};
use strata_etl::{Batch, Pipeline, WarehouseConfig, resolver::Resolver};
use strata_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Strata dimensional warehouse loader")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "strata.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Load a feed file as one batch.
  Load {
    #[arg(long, value_name = "CSV")]
    feed:           PathBuf,
    /// Date at which the feed's dimension snapshots become authoritative.
    #[arg(long)]
    effective_date: NaiveDate,
    /// Treat every event as a correction of an already loaded order line.
    #[arg(long)]
    correct:        bool,
  },
  /// Print every version of a natural key.
  History {
    #[arg(long)]
    dimension: String,
    #[arg(long)]
    key:       String,
  },
  /// Print the version of a natural key valid at a date.
  Resolve {
    #[arg(long)]
    dimension: String,
    #[arg(long)]
    key:       String,
    #[arg(long)]
    at:        NaiveDate,
  },
  /// List quarantined fact events.
  Quarantine {
    #[arg(long)]
    batch: Option<Uuid>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let cfg = WarehouseConfig::load(&cli.config)
    .with_context(|| format!("failed to load config from {:?}", cli.config))?;

  let store_path = cfg.store_path();
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  store
    .install_views(&cfg.dimensions, &cfg.fact)
    .await
    .context("failed to install reporting views")?;

  match cli.command {
    Command::Load { feed, effective_date, correct } => {
      load(store, &cfg, feed, effective_date, correct).await
    }
    Command::History { dimension, key } => history(&store, &dimension, key).await,
    Command::Resolve { dimension, key, at } => {
      resolve(&store, &dimension, key, at).await
    }
    Command::Quarantine { batch } => quarantine(&store, batch).await,
  }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn load(
  store: SqliteStore,
  cfg: &WarehouseConfig,
  feed: PathBuf,
  effective_date: NaiveDate,
  correct: bool,
) -> anyhow::Result<()> {
  let split = strata_feed::read(&feed, &cfg.feed)
    .with_context(|| format!("failed to read feed {feed:?}"))?;
  for rejected in &split.rejected {
    tracing::warn!(line = rejected.line, reason = %rejected.reason, "rejected feed record");
  }

  let batch = if correct {
    Batch::corrections_from_feed(effective_date, split)
  } else {
    Batch::from_feed(effective_date, split)
  };

  let pipeline = Pipeline::open(Arc::new(store), cfg).await?;
  let report = pipeline.run(batch).await.context("batch failed")?;

  println!("batch {} at {}", report.batch_id, report.effective_date);
  for d in &report.dimensions {
    println!(
      "  {:<16} inserted {:>6}  superseded {:>6}  unchanged {:>6}  kept {:>4}  failed {:>4}  rejected {:>4}",
      d.apply.dimension,
      d.apply.inserted,
      d.apply.superseded,
      d.apply.unchanged,
      d.apply.kept,
      d.apply.failures.len(),
      d.rejected.len(),
    );
    for failure in &d.apply.failures {
      println!("    {}: {}", failure.natural_key, failure.error);
    }
  }
  let f = &report.facts;
  println!(
    "  facts            written {:>6}  corrected {:>6}  loaded {:>6}  quarantined {:>4}  unknown {:>4}",
    f.written, f.corrected, f.already_loaded, f.quarantined, f.unknown_member,
  );
  if !report.feed_rejected.is_empty() {
    println!("  feed records rejected: {}", report.feed_rejected.len());
  }
  Ok(())
}

async fn history(store: &SqliteStore, dimension: &str, key: String) -> anyhow::Result<()> {
  let key = NaturalKey::new(key);
  let versions = store.history(dimension, &key).await?;
  if versions.is_empty() {
    println!("no versions of {dimension}/{key}");
  }
  for v in versions {
    let to = v.valid_to.map_or_else(|| "open".to_owned(), |d| d.to_string());
    println!(
      "{:>8}  [{} .. {})  {}",
      v.surrogate_key,
      v.valid_from,
      to,
      v.attributes.to_json()?
    );
  }
  Ok(())
}

async fn resolve(
  store: &SqliteStore,
  dimension: &str,
  key: String,
  at: NaiveDate,
) -> anyhow::Result<()> {
  let key = NaturalKey::new(key);
  let mut resolver = Resolver::new(store);
  let surrogate_key = resolver.resolve(dimension, &key, at).await?;
  println!("{dimension}/{key} at {at} -> {surrogate_key}");
  Ok(())
}

async fn quarantine(store: &SqliteStore, batch: Option<Uuid>) -> anyhow::Result<()> {
  for q in store.quarantined(batch).await? {
    println!(
      "{}  {}/{}  {}",
      q.batch_id,
      q.event.order_id,
      q.event.line,
      q.reasons.join("; ")
    );
  }
  Ok(())
}
