//! SQLite backend for the Strata warehouse.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every ledger write runs in its own
//! transaction, so a failed natural key never leaves a partial chain behind.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
