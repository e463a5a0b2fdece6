//! Core types and trait definitions for the Strata dimensional warehouse.
//!
//! This crate is deliberately free of async runtime and database
//! dependencies. It owns the versioned dimension model, the invariant checks
//! every ledger backend must enforce, the snapshot normalizer and the
//! surrogate key issuer.

pub mod dimension;
pub mod error;
pub mod fact;
pub mod issuer;
pub mod ledger;
pub mod memory;
pub mod schema;
pub mod snapshot;

pub use error::{Error, Result};
