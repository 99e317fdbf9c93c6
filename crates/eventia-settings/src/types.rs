//! Settings types.
//!
//! Every struct deserializes from camelCase JSON and falls back to its
//! [`Default`] for missing keys, so a partial settings file is always valid.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default number of rows fetched per cursor round trip.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Root settings for the storage engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Path of the `SQLite` database file.
    pub database_path: String,
    /// Connection pool tuning.
    pub pool: PoolSettings,
    /// Read-side tuning.
    pub read: ReadSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            database_path: format!("{home}/.eventia/events.db"),
            pool: PoolSettings::default(),
            read: ReadSettings::default(),
        }
    }
}

impl StorageSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "databasePath must not be empty".into(),
            ));
        }
        if self.pool.size == 0 {
            return Err(SettingsError::InvalidValue(
                "pool.size must be at least 1".into(),
            ));
        }
        if self.read.batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "read.batchSize must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Maximum pooled connections.
    pub size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache size in KiB.
    pub cache_size_kib: i64,
    /// How long to wait for a free connection, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 16,
            busy_timeout_ms: 30_000,
            cache_size_kib: 8192,
            connection_timeout_ms: 5_000,
        }
    }
}

/// Read-side settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadSettings {
    /// Rows fetched per cursor round trip.
    pub batch_size: usize,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
