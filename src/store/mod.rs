//! Versioned, transactional store for the domain state artifacts act on.
//!
//! The store is a SQLite database behind a single-writer lock:
//! - **Transactions**: `Store::begin` hands out a `StoreTxn` that rolls back unless committed
//! - **Versioning**: every commit carrying mutations bumps the version, and
//!   boundary writes naming an expected version are rejected on mismatch
//! - **Audit**: every commit leaves a `CommitReceipt` attributing it to an artifact
//!
//! # Example
//!
//! ```ignore
//! use reflector::store::{Store, TableSchema, ColumnType, Attribution};
//!
//! let store = Store::open_in_memory()?;
//! store.define_table(TableSchema::new("items").column("name", ColumnType::Text))?;
//! let outcome = store.write("items", &rows, Some(0), Attribution::artifact("manual"))?;
//! let rows = store.read("SELECT name FROM items")?;
//! ```

mod seed;
mod sqlite;
mod types;

pub use seed::{Demo, demo_store, seed};
pub use sqlite::{Store, StoreTxn, from_sql, is_interrupted, to_sql};
pub use types::{
    Attribution, Cmp, ColumnDef, ColumnType, CommitReceipt, Filter, Mutation, QueryRows, Row, RowValues,
    StoreSnapshot, TableSchema, WriteOutcome, diff_rows, is_identifier, is_internal_table,
};
