//! [`SqliteStore`]: the SQLite implementation of [`VersionLedger`] and
//! [`FactStore`].

use std::path::Path;

use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension as _};
use uuid::Uuid;

use strata_core::{
  dimension::{DimensionVersion, NaturalKey, NewVersion, SurrogateKey},
  fact::{FactRow, QuarantinedEvent},
  ledger::{FactStore, VersionLedger, check_append, check_close, plan_supersede},
  schema::{DimensionSchema, FactSchema},
};

use crate::{
  Result,
  encode::{
    FACT_COLUMNS, RawFactRow, RawQuarantined, RawVersion, VERSION_COLUMNS,
    encode_date, encode_dt, encode_uuid,
  },
  schema::{SCHEMA, dimension_view, fact_view},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Strata warehouse backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. All calls
/// are serialised on the connection's thread, and each ledger write is one
/// transaction.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// (Re)create the reporting views for the configured dimensions and fact
  /// table.
  pub async fn install_views(
    &self,
    dimensions: &[DimensionSchema],
    fact: &FactSchema,
  ) -> Result<()> {
    for dimension in dimensions {
      dimension.validate()?;
    }
    fact.validate(dimensions)?;

    let mut ddl: String = dimensions.iter().map(dimension_view).collect();
    ddl.push_str(&fact_view(fact));

    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&ddl)?;
        Ok(())
      })
      .await?;
    tracing::debug!(dimensions = dimensions.len(), fact = %fact.name, "installed views");
    Ok(())
  }
}

// ─── Connection-thread helpers ───────────────────────────────────────────────

/// Run `f` inside a transaction; any error rolls the transaction back.
fn write_tx<T>(
  conn: &mut Connection,
  f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
  let tx = conn.transaction()?;
  let value = f(&tx)?;
  tx.commit()?;
  Ok(value)
}

fn load_chain(
  conn: &Connection,
  dimension: &str,
  natural_key: &NaturalKey,
) -> Result<Vec<DimensionVersion>> {
  let mut stmt = conn.prepare_cached(&format!(
    "SELECT {VERSION_COLUMNS} FROM dimension_versions
     WHERE dimension = ?1 AND natural_key = ?2
     ORDER BY valid_from, valid_to IS NULL, valid_to"
  ))?;
  let raws = stmt
    .query_map(
      rusqlite::params![dimension, natural_key.as_str()],
      RawVersion::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawVersion::into_version).collect()
}

fn load_version(
  conn: &Connection,
  surrogate_key: SurrogateKey,
) -> Result<DimensionVersion> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {VERSION_COLUMNS} FROM dimension_versions WHERE surrogate_key = ?1"
      ),
      rusqlite::params![surrogate_key.0],
      RawVersion::from_row,
    )
    .optional()?
    .ok_or(strata_core::Error::VersionNotFound(surrogate_key))?;
  raw.into_version()
}

fn ensure_unused(conn: &Connection, surrogate_key: SurrogateKey) -> Result<()> {
  let taken = conn
    .query_row(
      "SELECT 1 FROM dimension_versions WHERE surrogate_key = ?1",
      rusqlite::params![surrogate_key.0],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  if taken {
    return Err(strata_core::Error::DuplicateSurrogateKey(surrogate_key).into());
  }
  Ok(())
}

fn insert_version(conn: &Connection, version: &DimensionVersion) -> Result<()> {
  conn.execute(
    "INSERT INTO dimension_versions (
       surrogate_key, dimension, natural_key, attributes_json, attr_hash,
       valid_from, valid_to, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    rusqlite::params![
      version.surrogate_key.0,
      version.dimension,
      version.natural_key.as_str(),
      version.attributes.to_json()?,
      version.attributes.fingerprint()?,
      encode_date(version.valid_from),
      version.valid_to.map(encode_date),
      encode_dt(version.recorded_at),
    ],
  )?;
  Ok(())
}

fn set_valid_to(
  conn: &Connection,
  surrogate_key: SurrogateKey,
  valid_to: NaiveDate,
) -> Result<()> {
  conn.execute(
    "UPDATE dimension_versions SET valid_to = ?2
     WHERE surrogate_key = ?1 AND valid_to IS NULL",
    rusqlite::params![surrogate_key.0, encode_date(valid_to)],
  )?;
  Ok(())
}

// ─── VersionLedger impl ──────────────────────────────────────────────────────

impl VersionLedger for SqliteStore {
  type Error = crate::Error;

  async fn current_version(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Result<Option<DimensionVersion>> {
    let dimension = dimension.to_owned();
    let key = natural_key.as_str().to_owned();

    let raw: Option<RawVersion> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {VERSION_COLUMNS} FROM dimension_versions
                 WHERE dimension = ?1 AND natural_key = ?2 AND valid_to IS NULL"
              ),
              rusqlite::params![dimension, key],
              RawVersion::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawVersion::into_version).transpose()
  }

  async fn append(&self, version: NewVersion) -> Result<DimensionVersion> {
    self
      .conn
      .call(move |conn| {
        Ok(write_tx(conn, |tx| {
          let chain = load_chain(tx, &version.dimension, &version.natural_key)?;
          check_append(&chain, &version)?;
          ensure_unused(tx, version.surrogate_key)?;

          let stored = version.into_version(Utc::now());
          insert_version(tx, &stored)?;
          Ok(stored)
        }))
      })
      .await?
  }

  async fn close(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
  ) -> Result<DimensionVersion> {
    self
      .conn
      .call(move |conn| {
        Ok(write_tx(conn, |tx| {
          let mut version = load_version(tx, surrogate_key)?;
          check_close(&version, valid_to)?;
          set_valid_to(tx, surrogate_key, valid_to)?;
          version.valid_to = Some(valid_to);
          Ok(version)
        }))
      })
      .await?
  }

  async fn supersede(
    &self,
    surrogate_key: SurrogateKey,
    valid_to: NaiveDate,
    replacement: NewVersion,
  ) -> Result<(DimensionVersion, DimensionVersion)> {
    let (closed, opened) = self
      .conn
      .call(move |conn| {
        Ok(write_tx(conn, |tx| {
          let current = load_version(tx, surrogate_key)?;
          let chain = load_chain(tx, &current.dimension, &current.natural_key)?;
          let closed = plan_supersede(&chain, surrogate_key, valid_to, &replacement)?;
          ensure_unused(tx, replacement.surrogate_key)?;

          set_valid_to(tx, surrogate_key, valid_to)?;
          let opened = replacement.into_version(Utc::now());
          insert_version(tx, &opened)?;
          Ok((closed, opened))
        }))
      })
      .await??;

    tracing::debug!(
      dimension = %opened.dimension,
      natural_key = %opened.natural_key,
      closed = %closed.surrogate_key,
      opened = %opened.surrogate_key,
      "superseded version"
    );
    Ok((closed, opened))
  }

  async fn version_at(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
    at: NaiveDate,
  ) -> Result<Option<DimensionVersion>> {
    let dimension = dimension.to_owned();
    let key = natural_key.as_str().to_owned();
    let at_str = encode_date(at);

    let raw: Option<RawVersion> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {VERSION_COLUMNS} FROM dimension_versions
                 WHERE dimension = ?1 AND natural_key = ?2
                   AND valid_from <= ?3
                   AND (valid_to IS NULL OR valid_to > ?3)"
              ),
              rusqlite::params![dimension, key, at_str],
              RawVersion::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawVersion::into_version).transpose()
  }

  async fn history(
    &self,
    dimension: &str,
    natural_key: &NaturalKey,
  ) -> Result<Vec<DimensionVersion>> {
    let dimension = dimension.to_owned();
    let key = natural_key.clone();
    self
      .conn
      .call(move |conn| Ok(load_chain(conn, &dimension, &key)))
      .await?
  }

  async fn max_surrogate_key(&self) -> Result<Option<SurrogateKey>> {
    let max: Option<i64> = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          "SELECT MAX(surrogate_key) FROM dimension_versions",
          [],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(max.map(SurrogateKey))
  }
}

// ─── FactStore impl ──────────────────────────────────────────────────────────

impl FactStore for SqliteStore {
  async fn append_fact(&self, row: FactRow) -> Result<bool> {
    let raw = RawFactRow::encode(&row)?;

    let inserted = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "INSERT OR IGNORE INTO facts (
             order_id, line, revision, kind, keys_json, measures_json,
             unknown_roles_json, batch_id, recorded_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          rusqlite::params![
            raw.order_id,
            raw.line,
            raw.revision,
            raw.kind,
            raw.keys_json,
            raw.measures_json,
            raw.unknown_roles_json,
            raw.batch_id,
            raw.recorded_at,
          ],
        )?;
        Ok(changed == 1)
      })
      .await?;
    Ok(inserted)
  }

  async fn fact_rows(&self, order_id: &str, line: u32) -> Result<Vec<FactRow>> {
    let order_id = order_id.to_owned();

    let raws: Vec<RawFactRow> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {FACT_COLUMNS} FROM facts
           WHERE order_id = ?1 AND line = ?2
           ORDER BY revision"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![order_id, line], RawFactRow::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawFactRow::into_fact_row).collect()
  }

  async fn quarantine(&self, entry: QuarantinedEvent) -> Result<()> {
    let order_id = entry.event.order_id.clone();
    let line = entry.event.line;
    let batch_str = encode_uuid(entry.batch_id);
    let event_json = serde_json::to_string(&entry.event)?;
    let reasons_json = serde_json::to_string(&entry.reasons)?;
    let at_str = encode_dt(entry.recorded_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO quarantine (order_id, line, batch_id, event_json, reasons_json, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT (order_id, line) DO UPDATE SET
             batch_id     = excluded.batch_id,
             event_json   = excluded.event_json,
             reasons_json = excluded.reasons_json,
             recorded_at  = excluded.recorded_at",
          rusqlite::params![order_id, line, batch_str, event_json, reasons_json, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn quarantined(&self, batch_id: Option<Uuid>) -> Result<Vec<QuarantinedEvent>> {
    let batch_str = batch_id.map(encode_uuid);

    let raws: Vec<RawQuarantined> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT batch_id, event_json, reasons_json, recorded_at
           FROM quarantine
           WHERE ?1 IS NULL OR batch_id = ?1
           ORDER BY recorded_at, rowid",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![batch_str], |row| {
            Ok(RawQuarantined {
              batch_id:     row.get(0)?,
              event_json:   row.get(1)?,
              reasons_json: row.get(2)?,
              recorded_at:  row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawQuarantined::into_quarantined).collect()
  }
}
