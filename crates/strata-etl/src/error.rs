//! Error types for `strata-etl`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] strata_core::Error),

  #[error("feed error: {0}")]
  Feed(#[from] strata_feed::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("worker task failed: {0}")]
  Worker(#[from] tokio::task::JoinError),

  #[error("no schema configured for dimension {0:?}")]
  UnknownDimension(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  pub(crate) fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
