//! # eventia-settings
//!
//! Configuration for the storage engine, loaded in layers:
//! compiled defaults, then `~/.eventia/settings.json`, then `EVENTIA_*`
//! environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{PoolSettings, ReadSettings, StorageSettings};
