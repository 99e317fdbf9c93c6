//! Versioned schema for the event log.
//!
//! Each step is plain SQL compiled into the binary. A step runs inside its own
//! transaction together with the `schema_version` row that records it, so a
//! failed step leaves no trace and rerunning the migrator applies only what is
//! missing.

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::errors::{Result, StorageError};

/// `(version, description, sql)` in ascending version order.
const STEPS: &[(u32, &str, &str)] = &[(
    1,
    "Events table with position, aggregate and log date indexes",
    include_str!("v001_events.sql"),
)];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    description TEXT
)";

fn migration_error(context: String) -> impl FnOnce(rusqlite::Error) -> StorageError {
    move |e| StorageError::Migration {
        message: format!("{context}: {e}"),
    }
}

/// Bring the schema up to date. Returns the number of steps applied.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(VERSION_TABLE)
        .map_err(migration_error("creating schema_version".into()))?;

    let current = current_version(conn)?;
    let mut applied = 0;
    for &(version, description, sql) in STEPS.iter().filter(|(v, _, _)| *v > current) {
        info!(version, description, "applying schema step");
        apply(conn, version, description, sql)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = current, "schema up to date");
    }
    Ok(applied)
}

/// Highest applied version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(migration_error("reading schema_version".into()))
}

/// Version the code expects after [`run_migrations`].
pub fn latest_version() -> u32 {
    STEPS.iter().map(|(version, _, _)| *version).max().unwrap_or(0)
}

fn apply(conn: &Connection, version: u32, description: &str, sql: &str) -> Result<()> {
    let context = |what: &str| format!("step v{version} ({description}): {what}");

    let tx = conn
        .unchecked_transaction()
        .map_err(migration_error(context("begin")))?;
    tx.execute_batch(sql)
        .map_err(migration_error(context("schema sql")))?;
    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
            params![version, description],
        )
        .map_err(migration_error(context("record version")))?;
    tx.commit().map_err(migration_error(context("commit")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        conn
    }

    fn insert(conn: &Connection, id: &str, sequence: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO Events (Id, AggregateIdentifier, SequenceNumber, AggregateType, PayloadType, Payload)
             VALUES (?1, 'agg', ?2, 'T', 'P', '{}')",
            params![id, sequence],
        )
    }

    #[test]
    fn events_columns() {
        let conn = migrated();
        let columns: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('Events') ORDER BY cid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            columns,
            [
                "Position",
                "Id",
                "AggregateIdentifier",
                "SequenceNumber",
                "AggregateType",
                "PayloadType",
                "Payload",
                "Metadata",
                "LogDate",
                "TenantIdentifier",
                "UserIdentifier",
            ]
        );
    }

    #[test]
    fn second_run_applies_nothing() {
        let conn = migrated();
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn deleted_positions_are_never_reused() {
        let conn = migrated();
        insert(&conn, "e1", 1).unwrap();
        insert(&conn, "e2", 2).unwrap();
        conn.execute("DELETE FROM Events WHERE Id = 'e2'", []).unwrap();
        insert(&conn, "e3", 3).unwrap();

        let position: i64 = conn
            .query_row("SELECT Position FROM Events WHERE Id = 'e3'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(position, 3);
    }

    #[test]
    fn aggregate_sequence_is_unique() {
        let conn = migrated();
        insert(&conn, "e1", 1).unwrap();
        assert!(insert(&conn, "e2", 1).is_err());
    }

    #[test]
    fn log_date_is_rfc3339_with_millis() {
        let conn = migrated();
        insert(&conn, "e1", 1).unwrap();
        let log_date: String = conn
            .query_row("SELECT LogDate FROM Events", [], |row| row.get(0))
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&log_date).is_ok(), "{log_date}");
        assert_eq!(log_date.len(), "2024-01-01T00:00:00.000Z".len());
    }
}
