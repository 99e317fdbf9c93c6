//! Shared fixtures: an in-process fake of the client traits that counts
//! acquisitions, releases, cursor closes and physical statements, and a
//! `SQLite` engine in a temporary directory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventia_core::{Position, TracingLogger};
use eventia_settings::StorageSettings;
use eventia_sqlite::{
    Connection, ConnectionSource, Cursor, SqliteEventStorageEngine, Statement, StorageError,
};

/// Observable state behind a [`FakeSource`].
#[derive(Default)]
pub struct FakeState {
    /// Rows the cursor yields: positions `1..=rows`.
    pub rows: i64,
    /// Read number (1-based) that fails.
    pub fail_read_on: Option<usize>,
    /// Every cursor close fails.
    pub fail_close: bool,
    /// Statements whose text contains this fail.
    pub fail_statement: Option<String>,

    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub cursors_opened: AtomicUsize,
    pub cursors_closed: AtomicUsize,
    pub reads: AtomicUsize,
    pub reads_in_flight: AtomicUsize,
    pub max_reads_in_flight: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn with_rows(rows: i64) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.cursors_closed.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// Physical statements equal to `text`.
    pub fn count_statement(&self, text: &str) -> usize {
        self.statements().iter().filter(|s| s.as_str() == text).count()
    }
}

/// Connection source over [`FakeState`].
#[derive(Clone)]
pub struct FakeSource {
    pub state: Arc<FakeState>,
}

impl FakeSource {
    pub fn new(state: FakeState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Worker(format!("injected {what} failure"))
}

#[async_trait]
impl ConnectionSource for FakeSource {
    type Connection = FakeConnection;

    async fn acquire(&self) -> eventia_sqlite::Result<FakeConnection> {
        let _ = self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl Connection for FakeConnection {
    type Cursor = FakeCursor;

    async fn execute(&mut self, statement: &Statement) -> eventia_sqlite::Result<usize> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(statement.text.clone());
        match &self.state.fail_statement {
            Some(pattern) if statement.text.contains(pattern.as_str()) => Err(injected("statement")),
            _ => Ok(1),
        }
    }

    async fn query_position(
        &mut self,
        statement: &Statement,
    ) -> eventia_sqlite::Result<Option<Position>> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(statement.text.clone());
        Ok(None)
    }

    async fn open_cursor(&mut self, _statement: &Statement) -> eventia_sqlite::Result<FakeCursor> {
        let _ = self.state.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeCursor {
            state: Arc::clone(&self.state),
            next: 1,
        })
    }

    fn release(self) {
        let _ = self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeCursor {
    state: Arc<FakeState>,
    next: i64,
}

#[async_trait]
impl Cursor for FakeCursor {
    type Row = i64;

    async fn read(&mut self, count: usize) -> eventia_sqlite::Result<Vec<i64>> {
        let read_number = self.state.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.state.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self
            .state
            .max_reads_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let _ = self.state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.state.fail_read_on == Some(read_number) {
            return Err(injected("read"));
        }
        let count = i64::try_from(count).unwrap();
        let end = (self.next + count - 1).min(self.state.rows);
        let rows: Vec<i64> = (self.next..=end).collect();
        self.next = end + 1;
        Ok(rows)
    }

    async fn close(&mut self) -> eventia_sqlite::Result<()> {
        let _ = self.state.cursors_closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close {
            return Err(injected("close"));
        }
        Ok(())
    }
}

/// Poll until `done` holds, yielding to spawned teardown tasks in between.
pub async fn wait_until(done: impl Fn() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

/// Engine over a fresh database file.
pub fn sqlite_engine() -> (tempfile::TempDir, SqliteEventStorageEngine) {
    let dir = tempfile::tempdir().unwrap();
    let settings = StorageSettings {
        database_path: dir.path().join("events.db").to_string_lossy().into_owned(),
        ..StorageSettings::default()
    };
    let engine =
        SqliteEventStorageEngine::open(&settings, Arc::new(TracingLogger::new("engine-test")))
            .unwrap();
    (dir, engine)
}
