//! Client traits implemented over the `r2d2` pool.
//!
//! `rusqlite` is synchronous and a stepping `Rows` borrows its `Statement`,
//! which borrows the connection. So each acquired connection is moved onto a
//! dedicated blocking worker that owns it for the whole lease. The async side
//! talks to the worker over a command channel; an open cursor lives on the
//! worker's stack between `OpenCursor` and `CloseCursor`.
//!
//! The lease ends when the worker sees [`Command::Release`] or every sender is
//! gone. Before the pooled connection goes back, any transaction still open on
//! it is rolled back.

use async_trait::async_trait;
use eventia_core::Position;
use rusqlite::{OptionalExtension, params_from_iter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::client::{Connection, ConnectionSource, Cursor, Statement};
use crate::errors::{Result, StorageError};
use crate::sqlite::connection::{ConnectionPool, PooledConnection};
use crate::sqlite::row_types::StoredEventRow;

const COMMAND_BUFFER: usize = 4;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Execute {
        statement: Statement,
        reply: Reply<usize>,
    },
    QueryPosition {
        statement: Statement,
        reply: Reply<Option<Position>>,
    },
    OpenCursor {
        statement: Statement,
        reply: Reply<()>,
    },
    ReadCursor {
        count: usize,
        reply: Reply<Vec<StoredEventRow>>,
    },
    CloseCursor {
        reply: Reply<()>,
    },
    Release,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::QueryPosition { .. } => "query_position",
            Self::OpenCursor { .. } => "open_cursor",
            Self::ReadCursor { .. } => "read_cursor",
            Self::CloseCursor { .. } => "close_cursor",
            Self::Release => "release",
        }
    }
}

/// Hands out worker-backed connections from an `r2d2` pool.
#[derive(Clone)]
pub struct SqliteConnectionSource {
    pool: ConnectionPool,
}

impl SqliteConnectionSource {
    /// Wrap an existing pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionSource for SqliteConnectionSource {
    type Connection = SqliteConnection;

    async fn acquire(&self) -> Result<SqliteConnection> {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (ready, leased) = oneshot::channel::<Result<()>>();
        let pool = self.pool.clone();

        let _ = tokio::task::spawn_blocking(move || match pool.get() {
            Ok(conn) => {
                if ready.send(Ok(())).is_ok() {
                    run_worker(&conn, receiver);
                }
                release_connection(&conn);
            }
            Err(e) => {
                let _ = ready.send(Err(StorageError::Pool(e)));
            }
        });

        leased.await.map_err(|_| worker_stopped("acquire"))??;
        debug!("connection acquired");
        Ok(SqliteConnection { commands })
    }
}

/// A pooled connection leased to one caller.
pub struct SqliteConnection {
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl Connection for SqliteConnection {
    type Cursor = SqliteCursor;

    async fn execute(&mut self, statement: &Statement) -> Result<usize> {
        let statement = statement.clone();
        request(&self.commands, |reply| Command::Execute { statement, reply }).await
    }

    async fn query_position(&mut self, statement: &Statement) -> Result<Option<Position>> {
        let statement = statement.clone();
        request(&self.commands, |reply| Command::QueryPosition { statement, reply }).await
    }

    async fn open_cursor(&mut self, statement: &Statement) -> Result<SqliteCursor> {
        let statement = statement.clone();
        request(&self.commands, |reply| Command::OpenCursor { statement, reply }).await?;
        Ok(SqliteCursor {
            commands: self.commands.clone(),
            closed: false,
        })
    }

    fn release(self) {
        // A full buffer means the worker is still busy; dropping the last
        // sender ends the lease once it drains.
        let _ = self.commands.try_send(Command::Release);
    }
}

/// Cursor stepping an open statement on the owning connection's worker.
pub struct SqliteCursor {
    commands: mpsc::Sender<Command>,
    closed: bool,
}

#[async_trait]
impl Cursor for SqliteCursor {
    type Row = StoredEventRow;

    async fn read(&mut self, count: usize) -> Result<Vec<StoredEventRow>> {
        if self.closed {
            return Err(StorageError::ProtocolMisuse(
                "read() called on a closed cursor".into(),
            ));
        }
        request(&self.commands, |reply| Command::ReadCursor { count, reply }).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        request(&self.commands, |reply| Command::CloseCursor { reply }).await
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        if !self.closed {
            let (reply, _) = oneshot::channel();
            let _ = self.commands.try_send(Command::CloseCursor { reply });
        }
    }
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (reply, response) = oneshot::channel();
    let command = build(reply);
    let name = command.name();
    commands
        .send(command)
        .await
        .map_err(|_| worker_stopped(name))?;
    response.await.map_err(|_| worker_stopped(name))?
}

fn worker_stopped(command: &str) -> StorageError {
    StorageError::Worker(format!("connection worker stopped during {command}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker (blocking side)
// ─────────────────────────────────────────────────────────────────────────────

enum Lease {
    Continue,
    End,
}

fn run_worker(conn: &PooledConnection, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Execute { statement, reply } => {
                let _ = reply.send(execute(conn, &statement));
            }
            Command::QueryPosition { statement, reply } => {
                let _ = reply.send(query_position(conn, &statement));
            }
            Command::OpenCursor { statement, reply } => {
                if let Lease::End = serve_cursor(conn, &statement, reply, &mut commands) {
                    return;
                }
            }
            Command::ReadCursor { reply, .. } => {
                let _ = reply.send(Err(StorageError::ProtocolMisuse(
                    "read_cursor with no open cursor".into(),
                )));
            }
            Command::CloseCursor { reply } => {
                let _ = reply.send(Ok(()));
            }
            Command::Release => return,
        }
    }
}

fn execute(conn: &PooledConnection, statement: &Statement) -> Result<usize> {
    Ok(conn.execute(&statement.text, params_from_iter(statement.values.iter()))?)
}

fn query_position(conn: &PooledConnection, statement: &Statement) -> Result<Option<Position>> {
    let position = conn
        .query_row(
            &statement.text,
            params_from_iter(statement.values.iter()),
            |row| row.get::<_, Option<Position>>(0),
        )
        .optional()?
        .flatten();
    Ok(position)
}

fn serve_cursor(
    conn: &PooledConnection,
    statement: &Statement,
    opened: Reply<()>,
    commands: &mut mpsc::Receiver<Command>,
) -> Lease {
    let mut prepared = match conn.prepare(&statement.text) {
        Ok(prepared) => prepared,
        Err(e) => {
            let _ = opened.send(Err(e.into()));
            return Lease::Continue;
        }
    };
    let mut rows = match prepared.query(params_from_iter(statement.values.iter())) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = opened.send(Err(e.into()));
            return Lease::Continue;
        }
    };
    let _ = opened.send(Ok(()));
    debug!(sql = %statement.text, "cursor opened");

    let mut exhausted = false;
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::ReadCursor { count, reply } => {
                let mut batch = Vec::with_capacity(count);
                let result: Result<Vec<StoredEventRow>> = loop {
                    if exhausted || batch.len() == count {
                        break Ok(std::mem::take(&mut batch));
                    }
                    match rows.next() {
                        Ok(Some(row)) => match StoredEventRow::from_row(row) {
                            Ok(stored) => batch.push(stored),
                            Err(e) => break Err(e.into()),
                        },
                        Ok(None) => exhausted = true,
                        Err(e) => break Err(e.into()),
                    }
                };
                let _ = reply.send(result);
            }
            Command::CloseCursor { reply } => {
                debug!("cursor closed");
                let _ = reply.send(Ok(()));
                return Lease::Continue;
            }
            Command::Release => {
                warn!("connection released with an open cursor");
                return Lease::End;
            }
            other => {
                let name = other.name();
                reject_while_cursor_open(other, name);
            }
        }
    }
    Lease::End
}

fn reject_while_cursor_open(command: Command, name: &str) {
    let misuse = || {
        StorageError::ProtocolMisuse(format!("{name} while a cursor is open on the connection"))
    };
    match command {
        Command::Execute { reply, .. } => {
            let _ = reply.send(Err(misuse()));
        }
        Command::QueryPosition { reply, .. } => {
            let _ = reply.send(Err(misuse()));
        }
        Command::OpenCursor { reply, .. } => {
            let _ = reply.send(Err(misuse()));
        }
        Command::ReadCursor { .. } | Command::CloseCursor { .. } | Command::Release => {}
    }
}

fn release_connection(conn: &PooledConnection) {
    if !conn.is_autocommit() {
        warn!("connection released inside an open transaction, rolling back");
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback on release failed");
        }
    }
    debug!("connection released");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
