//! Surrogate key issuance.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::dimension::SurrogateKey;

/// Hands out surrogate keys that are never reused. Implementations must be
/// safe to call from concurrent workers.
pub trait KeyIssuer: Send + Sync {
  fn issue(&self) -> SurrogateKey;
}

/// Sequential issuer backed by an atomic counter. Keys start at 1 so that
/// [`SurrogateKey::UNKNOWN`] is never handed out.
#[derive(Debug)]
pub struct SequenceIssuer {
  next: AtomicI64,
}

impl SequenceIssuer {
  pub fn new() -> Self { Self { next: AtomicI64::new(1) } }

  /// Resume after the highest key already persisted, if any.
  pub fn resume_after(last: Option<SurrogateKey>) -> Self {
    let start = last.map_or(1, |k| k.0.max(0) + 1);
    Self { next: AtomicI64::new(start) }
  }
}

impl Default for SequenceIssuer {
  fn default() -> Self { Self::new() }
}

impl KeyIssuer for SequenceIssuer {
  fn issue(&self) -> SurrogateKey {
    SurrogateKey(self.next.fetch_add(1, Ordering::Relaxed))
  }
}
