//! Pooled `SQLite` connections for the event log.
//!
//! Every connection handed out by the pool has passed through
//! [`SessionPragmas`], so WAL journaling and the busy timeout hold no matter
//! which connection a cursor or transaction lands on. WAL lets a reader keep a
//! cursor open while a writer on another connection appends.
//!
//! Only file-backed pools exist here: connections of an in-memory manager each
//! see a separate database.

use std::time::Duration;

use eventia_settings::PoolSettings;
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pool of event log connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// A connection checked out of [`ConnectionPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and per-connection tuning.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Upper bound on open connections.
    pub pool_size: u32,
    /// How long a statement waits on a locked database.
    pub busy_timeout_ms: u32,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: i64,
    /// How long `acquire` waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for ConnectionConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            pool_size: settings.size,
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
        }
    }
}

/// Pragmas applied when the pool opens a connection.
///
/// `busy_timeout` goes first: switching to WAL takes a lock that concurrent
/// opens of the same file contend for.
#[derive(Debug)]
struct SessionPragmas {
    busy_timeout_ms: u32,
    cache_size_kib: i64,
}

impl SessionPragmas {
    fn script(&self) -> String {
        [
            format!("PRAGMA busy_timeout = {};", self.busy_timeout_ms),
            "PRAGMA journal_mode = WAL;".to_string(),
            "PRAGMA foreign_keys = ON;".to_string(),
            format!("PRAGMA cache_size = -{};", self.cache_size_kib),
            "PRAGMA synchronous = NORMAL;".to_string(),
        ]
        .concat()
    }
}

impl CustomizeConnection<Connection, rusqlite::Error> for SessionPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&self.script())
    }
}

/// Open a pool over the database file at `path`, creating the file if needed.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let pragmas = SessionPragmas {
        busy_timeout_ms: config.busy_timeout_ms,
        cache_size_kib: config.cache_size_kib,
    };
    Ok(Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.connection_timeout)
        .connection_customizer(Box::new(pragmas))
        .build(SqliteConnectionManager::file(path))?)
}

/// Pragmas observed on a live connection.
#[derive(Debug, PartialEq, Eq)]
pub struct PragmaState {
    /// `wal` once the customizer ran.
    pub journal_mode: String,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: i64,
    /// Whether foreign keys are enforced.
    pub foreign_keys: bool,
}

/// Read back the pragmas that matter for concurrent cursors and writers.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let read = |pragma: &str| -> rusqlite::Result<rusqlite::types::Value> {
        conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))
    };
    let journal_mode = match read("journal_mode")? {
        rusqlite::types::Value::Text(mode) => mode,
        other => format!("{other:?}"),
    };
    let busy_timeout_ms = match read("busy_timeout")? {
        rusqlite::types::Value::Integer(ms) => ms,
        _ => 0,
    };
    let foreign_keys = matches!(read("foreign_keys")?, rusqlite::types::Value::Integer(1));
    Ok(PragmaState {
        journal_mode,
        busy_timeout_ms,
        foreign_keys,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
