//! `SQLite` backend.
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode and busy timeout applied to
//!   every connection.
//! - **[`migrations`]**: version-tracked schema, embedded at compile time.
//! - **[`row_types`]**: the physical `Events` row and its conversion to a
//!   tracked message.
//! - **[`worker`]**: the client traits implemented by leasing each pooled
//!   connection to a blocking worker.

pub mod connection;
pub mod migrations;
pub mod row_types;
pub mod worker;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, verify_pragmas};
pub use migrations::{current_version, latest_version, run_migrations};
pub use row_types::StoredEventRow;
pub use worker::{SqliteConnection, SqliteConnectionSource, SqliteCursor};
