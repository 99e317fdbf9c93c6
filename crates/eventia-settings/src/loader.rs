//! Layered settings resolution.
//!
//! Later layers win: compiled defaults, then the JSON file, then `EVENTIA_*`
//! variables. The file may be partial. Its objects overlay the defaults key by
//! key, arrays and scalars replace, and `null` leaves the default in place.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::StorageSettings;

/// `~/.eventia/settings.json`, or under `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".eventia").join("settings.json")
}

/// Resolve settings from [`settings_path`].
pub fn load_settings() -> Result<StorageSettings> {
    load_settings_from_path(&settings_path())
}

/// Resolve settings from the file at `path`. An absent file is not an error.
pub fn load_settings_from_path(path: &Path) -> Result<StorageSettings> {
    let mut layered = serde_json::to_value(StorageSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "overlaying settings file");
            overlay(&mut layered, serde_json::from_str(&text)?);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(e) => return Err(e.into()),
    }

    let mut settings: StorageSettings = serde_json::from_value(layered)?;
    for var in ENV_OVERRIDES {
        if let Ok(raw) = std::env::var(var.name) {
            (var.apply)(&mut settings, raw.trim()).unwrap_or_else(|| {
                warn!(var = var.name, value = %raw, "ignoring unusable override");
            });
        }
    }
    settings.validate()?;
    Ok(settings)
}

fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => overlay_map(base, layer),
        (_, Value::Null) => {}
        (base, layer) => *base = layer,
    }
}

fn overlay_map(base: &mut Map<String, Value>, layer: Map<String, Value>) {
    for (key, value) in layer {
        match base.get_mut(&key) {
            Some(existing) => overlay(existing, value),
            None if !value.is_null() => {
                let _ = base.insert(key, value);
            }
            None => {}
        }
    }
}

struct EnvOverride {
    name: &'static str,
    apply: fn(&mut StorageSettings, &str) -> Option<()>,
}

const ENV_OVERRIDES: &[EnvOverride] = &[
    EnvOverride {
        name: "EVENTIA_DATABASE_PATH",
        apply: |s, v| {
            (!v.is_empty()).then(|| s.database_path = v.to_owned())
        },
    },
    EnvOverride {
        name: "EVENTIA_POOL_SIZE",
        apply: |s, v| bounded(v, 1, 256).map(|n| s.pool.size = n),
    },
    EnvOverride {
        name: "EVENTIA_BUSY_TIMEOUT_MS",
        apply: |s, v| bounded(v, 0, 600_000).map(|n| s.pool.busy_timeout_ms = n),
    },
    EnvOverride {
        name: "EVENTIA_BATCH_SIZE",
        apply: |s, v| bounded(v, 1, 100_000).map(|n| s.read.batch_size = n),
    },
];

fn bounded<T>(raw: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    raw.parse().ok().filter(|n| (min..=max).contains(n))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::SettingsError;

    fn write_settings(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn overlay_keeps_untouched_keys() {
        let mut base = json!({"pool": {"size": 16, "busyTimeoutMs": 30000}, "tags": [1, 2]});
        overlay(&mut base, json!({"pool": {"size": 4, "busyTimeoutMs": null}, "tags": [3]}));
        assert_eq!(
            base,
            json!({"pool": {"size": 4, "busyTimeoutMs": 30000}, "tags": [3]})
        );
    }

    #[test]
    fn overlay_adds_new_keys_but_not_nulls() {
        let mut base = json!({"a": 1});
        overlay(&mut base, json!({"b": 2, "c": null}));
        assert_eq!(base, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn bounded_parsing() {
        assert_eq!(bounded("500", 1_u32, 1000), Some(500));
        assert_eq!(bounded("0", 1_u32, 10), None);
        assert_eq!(bounded("11", 1_u32, 10), None);
        assert_eq!(bounded::<usize>("many", 1, 10), None);
    }

    #[test]
    fn overrides_reject_out_of_range() {
        let mut settings = StorageSettings::default();
        let pool_size = &ENV_OVERRIDES[1];
        assert_eq!((pool_size.apply)(&mut settings, "0"), None);
        assert_eq!(settings.pool.size, 16);
        assert_eq!((pool_size.apply)(&mut settings, "8"), Some(()));
        assert_eq!(settings.pool.size, 8);

        let path = &ENV_OVERRIDES[0];
        assert_eq!((path.apply)(&mut settings, ""), None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.read.batch_size, StorageSettings::default().read.batch_size);
    }

    #[test]
    fn file_values_layer_over_defaults() {
        let (_dir, path) =
            write_settings(r#"{"databasePath": "/srv/events.db", "read": {"batchSize": 64}}"#);
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.database_path, "/srv/events.db");
        assert_eq!(settings.read.batch_size, 64);
        assert_eq!(settings.pool.size, 16);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let (_dir, path) = write_settings("{not json");
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn zero_batch_fails_validation() {
        let (_dir, path) = write_settings(r#"{"read": {"batchSize": 0}}"#);
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }
}
