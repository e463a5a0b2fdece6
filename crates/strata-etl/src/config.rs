//! Warehouse configuration, deserialised from `strata.toml` layered with
//! `STRATA_*` environment variables.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
};

use serde::Deserialize;
use strata_core::{
  schema::{DimensionSchema, FactSchema},
  snapshot::TieBreak,
};
use strata_feed::FeedMapping;

use crate::error::{Error, Result};

fn default_workers() -> usize { 4 }

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
  /// SQLite file; a leading `~/` expands to `$HOME`.
  pub store_path: PathBuf,
  /// Worker tasks per dimension during the apply phase.
  #[serde(default = "default_workers")]
  pub workers:    usize,
  #[serde(default)]
  pub tie_break:  TieBreak,
  pub dimensions: Vec<DimensionSchema>,
  pub fact:       FactSchema,
  pub feed:       FeedMapping,
}

impl WarehouseConfig {
  /// Read `path` (TOML) and overlay `STRATA_*` environment variables.
  pub fn load(path: &Path) -> Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path))
      .add_source(config::Environment::with_prefix("STRATA").try_parsing(true))
      .build()
      .map_err(|e| Error::Config(e.to_string()))?;
    Self::from_settings(settings)
  }

  /// Parse a TOML document, without environment overrides.
  pub fn from_toml(toml: &str) -> Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .map_err(|e| Error::Config(e.to_string()))?;
    Self::from_settings(settings)
  }

  fn from_settings(settings: config::Config) -> Result<Self> {
    let cfg: Self = settings
      .try_deserialize()
      .map_err(|e| Error::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
  }

  /// Check schemas and that the feed mapping lines up with them.
  pub fn validate(&self) -> Result<()> {
    if self.workers == 0 {
      return Err(Error::Config("workers must be at least 1".into()));
    }

    let mut names = HashSet::new();
    for dimension in &self.dimensions {
      dimension.validate()?;
      if !names.insert(dimension.name.as_str()) {
        return Err(Error::Config(format!(
          "dimension {:?} is declared twice",
          dimension.name
        )));
      }
    }
    self.fact.validate(&self.dimensions)?;

    for mapped in &self.feed.dimensions {
      let schema = self
        .dimension(&mapped.dimension)
        .ok_or_else(|| Error::UnknownDimension(mapped.dimension.clone()))?;
      if let Some(attr) = mapped
        .attributes
        .keys()
        .find(|a| schema.attribute(a).is_none())
      {
        return Err(Error::Config(format!(
          "feed maps attribute {attr:?} that dimension {:?} does not declare",
          schema.name
        )));
      }
    }

    for role in &self.fact.roles {
      if !self.feed.roles.iter().any(|r| r.role == role.name) {
        return Err(Error::Config(format!(
          "fact role {:?} has no feed columns",
          role.name
        )));
      }
    }
    Ok(())
  }

  pub fn dimension(&self, name: &str) -> Option<&DimensionSchema> {
    self.dimensions.iter().find(|d| d.name == name)
  }

  /// `store_path` with a leading `~/` expanded.
  pub fn store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
