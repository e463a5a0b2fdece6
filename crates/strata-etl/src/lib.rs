//! Batch processing for the Strata warehouse.
//!
//! Wires the pieces of `strata-core` into the two-phase batch:
//!
//! - [`applier::ChangeApplier`] brings each dimension's version chains in line
//!   with a batch's snapshots, in parallel per natural key.
//! - [`resolver::Resolver`] finds the version valid at an event's date.
//! - [`assembler::FactAssembler`] resolves every role of a fact event and
//!   writes the immutable fact row (or its correction).
//! - [`pipeline::Pipeline`] runs normalize → apply → assemble with a barrier
//!   between the dimension and fact phases.
//!
//! Works against any [`strata_core::ledger::FactStore`]; the `strata` binary
//! uses `strata-store-sqlite`.

pub mod applier;
pub mod assembler;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod resolver;

pub use config::WarehouseConfig;
pub use error::{Error, Result};
pub use pipeline::{Batch, BatchReport, Pipeline};

#[cfg(test)]
mod tests;
