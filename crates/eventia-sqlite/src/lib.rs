//! # eventia-sqlite
//!
//! Relational storage substrate for the Eventia event store, backed by `SQLite`.
//!
//! - **Client seam**: [`ConnectionSource`] / [`Connection`] / [`Cursor`] async traits,
//!   implemented over an `r2d2` pool where each acquired connection is driven by a
//!   blocking worker
//! - **Query compiler**: [`EventQuery`] turns a [`ResumptionToken`] plus explicit
//!   filters into a parameterized `SELECT`
//! - **Cursor stream**: [`BatchCursorStream`] yields rows lazily in prefetched batches
//!   and tears the cursor down exactly once on every exit path
//! - **Nested transaction**: [`NestedTransaction`] shares one physical transaction
//!   across cooperating writers by reference counting
//! - **Engine**: [`SqliteEventStorageEngine`] composes the above into append, read and
//!   token derivation
//!
//! [`ResumptionToken`]: eventia_core::ResumptionToken

#![deny(unsafe_code)]

pub mod client;
pub mod cursor;
pub mod engine;
pub mod errors;
pub mod query;
pub mod sqlite;
pub mod transaction;

pub use client::{Connection, ConnectionSource, Cursor, Statement};
pub use cursor::{BatchCursorStream, DEFAULT_BATCH_SIZE, RowOf};
pub use engine::{EventStream, SqliteEventStorageEngine};
pub use errors::{Result, StorageError};
pub use query::{EventQuery, Field, FilterBuilder, Operator, Ordering};
pub use sqlite::{ConnectionConfig, SqliteConnectionSource, StoredEventRow};
pub use transaction::NestedTransaction;
