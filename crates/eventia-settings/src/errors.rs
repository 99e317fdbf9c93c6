//! Errors raised while resolving settings.

use thiserror::Error;

/// Why settings could not be resolved.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("settings file unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON, or does not fit the schema.
    #[error("settings JSON rejected: {0}")]
    Json(#[from] serde_json::Error),
    /// A resolved value the storage engine cannot run with.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
