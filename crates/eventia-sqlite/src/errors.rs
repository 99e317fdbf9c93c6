//! Error types for the storage engine.
//!
//! [`StorageError`] is returned by every fallible operation. Database failures
//! pass through unchanged; caller misuse, query construction problems and
//! unsupported read modes get their own variants so they can be told apart
//! from I/O without string matching.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Filesystem error preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings were rejected.
    #[error("settings error: {0}")]
    Settings(#[from] eventia_settings::SettingsError),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The worker driving a connection stopped or a background read task failed.
    #[error("connection worker error: {0}")]
    Worker(String),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// The caller broke the transaction or cursor protocol.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// A query could not be compiled.
    #[error("query build error: {0}")]
    QueryBuild(String),

    /// The requested read mode is not supported.
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    /// An argument or stored value was out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// Whether this error came from the database, the pool or a connection worker.
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Pool(_) | Self::Worker(_))
    }
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
