//! SQL schema for the Strata SQLite store.
//!
//! The base tables are generic over dimensions and roles. Reporting consumers
//! read the per-dimension and per-fact-table views generated from the
//! configured schemas, which expose one column per attribute, role and
//! measure.

use strata_core::schema::{DimensionSchema, FactSchema};

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per dimension version. The only UPDATE ever issued sets valid_to
-- on an open row; the triggers below reject everything else.
CREATE TABLE IF NOT EXISTS dimension_versions (
    surrogate_key   INTEGER PRIMARY KEY,
    dimension       TEXT NOT NULL,
    natural_key     TEXT NOT NULL,
    attributes_json TEXT NOT NULL,   -- tagged JSON of the attribute map
    attr_hash       TEXT NOT NULL,   -- SHA-256 hex of attributes_json
    valid_from      TEXT NOT NULL,   -- YYYY-MM-DD, inclusive
    valid_to        TEXT,            -- YYYY-MM-DD, exclusive; NULL = open
    is_current      INTEGER GENERATED ALWAYS AS (valid_to IS NULL) VIRTUAL,
    recorded_at     TEXT NOT NULL,   -- RFC 3339 UTC; store-assigned
    CHECK (surrogate_key > 0),
    CHECK (valid_to IS NULL OR valid_to >= valid_from)
);

-- At most one open version per natural key.
CREATE UNIQUE INDEX IF NOT EXISTS dimension_versions_one_current
    ON dimension_versions(dimension, natural_key) WHERE valid_to IS NULL;
CREATE INDEX IF NOT EXISTS dimension_versions_chain_idx
    ON dimension_versions(dimension, natural_key, valid_from);

CREATE TRIGGER IF NOT EXISTS dimension_versions_closed_immutable
BEFORE UPDATE ON dimension_versions
WHEN OLD.valid_to IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'closed dimension versions are immutable');
END;

CREATE TRIGGER IF NOT EXISTS dimension_versions_payload_immutable
BEFORE UPDATE OF surrogate_key, dimension, natural_key, attributes_json,
                 attr_hash, valid_from, recorded_at
ON dimension_versions
BEGIN
    SELECT RAISE(ABORT, 'dimension version payload is immutable');
END;

CREATE TRIGGER IF NOT EXISTS dimension_versions_no_delete
BEFORE DELETE ON dimension_versions
BEGIN
    SELECT RAISE(ABORT, 'dimension versions are never deleted');
END;

-- Fact rows are strictly append-only.
CREATE TABLE IF NOT EXISTS facts (
    order_id           TEXT    NOT NULL,
    line               INTEGER NOT NULL,
    revision           INTEGER NOT NULL,
    kind               TEXT    NOT NULL,  -- 'original' | 'reversal' | 'replacement'
    keys_json          TEXT    NOT NULL,  -- role -> surrogate key
    measures_json      TEXT    NOT NULL,  -- measure -> value
    unknown_roles_json TEXT    NOT NULL DEFAULT '[]',
    batch_id           TEXT    NOT NULL,
    recorded_at        TEXT    NOT NULL,
    PRIMARY KEY (order_id, line, revision)
);

CREATE TRIGGER IF NOT EXISTS facts_append_only
BEFORE UPDATE ON facts
BEGIN
    SELECT RAISE(ABORT, 'fact rows are immutable');
END;

CREATE INDEX IF NOT EXISTS facts_batch_idx ON facts(batch_id);

-- Events that could not be resolved under a quarantine policy. One entry per
-- order line; a later attempt replaces the earlier one.
CREATE TABLE IF NOT EXISTS quarantine (
    order_id     TEXT    NOT NULL,
    line         INTEGER NOT NULL,
    batch_id     TEXT    NOT NULL,
    event_json   TEXT    NOT NULL,
    reasons_json TEXT    NOT NULL,
    recorded_at  TEXT    NOT NULL,
    PRIMARY KEY (order_id, line)
);

CREATE INDEX IF NOT EXISTS quarantine_batch_idx ON quarantine(batch_id);

PRAGMA user_version = 1;
";

/// DDL for the `dim_<name>` view: one column per attribute. Names are
/// validated identifiers, so they are safe to splice.
pub fn dimension_view(schema: &DimensionSchema) -> String {
  let name = &schema.name;
  let columns: String = schema
    .attributes
    .iter()
    .map(|a| {
      format!(
        "       json_extract(attributes_json, '$.{0}.value') AS {0},\n",
        a.name
      )
    })
    .collect();

  format!(
    "DROP VIEW IF EXISTS dim_{name};
CREATE VIEW dim_{name} AS
SELECT surrogate_key,
       natural_key,
{columns}       valid_from,
       valid_to,
       is_current
FROM dimension_versions
WHERE dimension = '{name}';
"
  )
}

/// DDL for the `fact_<name>` view: one `<role>_key` column per role and one
/// column per measure.
pub fn fact_view(schema: &FactSchema) -> String {
  let name = &schema.name;
  let roles: String = schema
    .roles
    .iter()
    .map(|r| format!(",\n       json_extract(keys_json, '$.{0}') AS {0}_key", r.name))
    .collect();
  let measures: String = schema
    .measures
    .iter()
    .map(|m| format!(",\n       json_extract(measures_json, '$.{m}') AS {m}"))
    .collect();

  format!(
    "DROP VIEW IF EXISTS fact_{name};
CREATE VIEW fact_{name} AS
SELECT order_id,
       line,
       revision,
       kind{roles}{measures}
FROM facts;
"
  )
}
