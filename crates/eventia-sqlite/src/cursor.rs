//! Lazy, batched reads over a server-side cursor.
//!
//! [`BatchCursorStream`] acquires a connection, opens a cursor and reads in
//! fixed-size batches, keeping at most one read in flight while the consumer
//! drains the current batch:
//!
//! ```text
//! Idle ──first read──▶ PrefetchInFlight ──full batch──▶ PrefetchInFlight
//!                           │
//!                           └──short batch──▶ Draining ──▶ Closed
//! ```
//!
//! A batch shorter than the batch size ends the stream. When the row count is
//! an exact multiple of the batch size this costs one extra read returning
//! nothing.
//!
//! The cursor and its connection live in a `CursorSession`. Teardown (close
//! the cursor, then release the connection) runs exactly once: on exhaustion,
//! on [`BatchCursorStream::close`], after a read error, or from `Drop` when the
//! consumer walks away early.

use std::mem;
use std::vec;

use eventia_core::ReadMode;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{Connection, ConnectionSource, Cursor, Statement};
use crate::errors::{Result, StorageError};

pub use eventia_settings::types::DEFAULT_BATCH_SIZE;

type ConnectionOf<S> = <S as ConnectionSource>::Connection;
type CursorOf<S> = <ConnectionOf<S> as Connection>::Cursor;

/// Row type yielded by a stream over connections from `S`.
pub type RowOf<S> = <CursorOf<S> as Cursor>::Row;

type PendingRead<S> = JoinHandle<(CursorOf<S>, Result<Vec<RowOf<S>>>)>;

/// Single-pass stream of rows from one compiled query.
pub struct BatchCursorStream<S: ConnectionSource> {
    source: S,
    statement: Statement,
    batch_size: usize,
    state: State<S>,
}

enum State<S: ConnectionSource> {
    /// Nothing acquired yet.
    Idle,
    /// Draining `batch` while the next read runs on `session`.
    PrefetchInFlight {
        session: CursorSession<S>,
        batch: vec::IntoIter<RowOf<S>>,
    },
    /// Final batch; the session is already torn down.
    Draining {
        batch: vec::IntoIter<RowOf<S>>,
        error: Option<StorageError>,
    },
    Closed,
}

impl<S: ConnectionSource> BatchCursorStream<S> {
    /// Prepare a stream. No connection is acquired until the first row is pulled.
    ///
    /// Live reads and a zero batch size are rejected here, before any I/O.
    pub fn new(source: S, statement: Statement, batch_size: usize, mode: ReadMode) -> Result<Self> {
        if mode == ReadMode::Live {
            return Err(StorageError::UnsupportedMode(
                "live event tailing is not supported; only historical reads".into(),
            ));
        }
        if batch_size == 0 {
            return Err(StorageError::InvalidArgument(
                "batch size must be at least 1".into(),
            ));
        }
        Ok(Self {
            source,
            statement,
            batch_size,
            state: State::Idle,
        })
    }

    /// Rows per cursor read.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether the stream has finished or been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Pull the next row. `None` once the stream is finished.
    ///
    /// An error ends the stream; the cursor and connection are already torn
    /// down when it is returned.
    pub async fn next_row(&mut self) -> Option<Result<RowOf<S>>> {
        loop {
            match mem::replace(&mut self.state, State::Closed) {
                State::Idle => match open(&self.source, &self.statement, self.batch_size).await {
                    Ok(state) => self.state = state,
                    Err(e) => return Some(Err(e)),
                },
                State::PrefetchInFlight {
                    mut session,
                    mut batch,
                } => {
                    if let Some(row) = batch.next() {
                        self.state = State::PrefetchInFlight { session, batch };
                        return Some(Ok(row));
                    }
                    match session.await_read().await {
                        Ok(rows) => self.state = advance(session, rows, self.batch_size).await,
                        Err(e) => {
                            abandon(session).await;
                            return Some(Err(e));
                        }
                    }
                }
                State::Draining { mut batch, error } => {
                    if let Some(row) = batch.next() {
                        self.state = State::Draining { batch, error };
                        return Some(Ok(row));
                    }
                    return error.map(Err);
                }
                State::Closed => return None,
            }
        }
    }

    /// Stop early, closing the cursor and releasing the connection.
    ///
    /// Idempotent. Returns the teardown error, if any.
    pub async fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::PrefetchInFlight { mut session, .. } => session.teardown().await,
            State::Draining { error, .. } => error.map_or(Ok(()), Err),
            State::Idle | State::Closed => Ok(()),
        }
    }

    /// Adapt into a [`futures::Stream`]. Dropping the stream tears down the cursor.
    pub fn into_stream(self) -> BoxStream<'static, Result<RowOf<S>>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_row().await.map(|item| (item, stream))
        })
        .boxed()
    }
}

/// Acquire a connection, open the cursor and read the first batch.
async fn open<S: ConnectionSource>(
    source: &S,
    statement: &Statement,
    batch_size: usize,
) -> Result<State<S>> {
    let mut connection = source.acquire().await?;
    let cursor = match connection.open_cursor(statement).await {
        Ok(cursor) => cursor,
        Err(e) => {
            connection.release();
            return Err(e);
        }
    };
    debug!(batch_size, "cursor stream opened");

    let mut session = CursorSession::new(connection, cursor);
    match session.read(batch_size).await {
        Ok(rows) => Ok(advance(session, rows, batch_size).await),
        Err(e) => {
            abandon(session).await;
            Err(e)
        }
    }
}

/// Move past a completed read: prefetch after a full batch, tear down after a
/// short one.
async fn advance<S: ConnectionSource>(
    mut session: CursorSession<S>,
    rows: Vec<RowOf<S>>,
    batch_size: usize,
) -> State<S> {
    counter!("eventia_cursor_batches_total").increment(1);
    debug!(rows = rows.len(), batch_size, "cursor batch read");

    if rows.len() >= batch_size {
        session.prefetch(batch_size);
        State::PrefetchInFlight {
            session,
            batch: rows.into_iter(),
        }
    } else {
        let error = session.teardown().await.err();
        State::Draining {
            batch: rows.into_iter(),
            error,
        }
    }
}

/// Tear down after a read failure; the read error takes precedence.
async fn abandon<S: ConnectionSource>(mut session: CursorSession<S>) {
    if let Err(e) = session.teardown().await {
        warn!(error = %e, "cursor teardown failed after read error");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

enum CursorSlot<S: ConnectionSource> {
    Parked(CursorOf<S>),
    Reading(PendingRead<S>),
    Gone,
}

/// One connection plus the cursor opened on it.
struct CursorSession<S: ConnectionSource> {
    connection: Option<ConnectionOf<S>>,
    cursor: CursorSlot<S>,
}

impl<S: ConnectionSource> CursorSession<S> {
    fn new(connection: ConnectionOf<S>, cursor: CursorOf<S>) -> Self {
        Self {
            connection: Some(connection),
            cursor: CursorSlot::Parked(cursor),
        }
    }

    fn is_torn_down(&self) -> bool {
        self.connection.is_none() && matches!(self.cursor, CursorSlot::Gone)
    }

    async fn read(&mut self, count: usize) -> Result<Vec<RowOf<S>>> {
        match &mut self.cursor {
            CursorSlot::Parked(cursor) => cursor.read(count).await,
            CursorSlot::Reading(_) | CursorSlot::Gone => Err(StorageError::ProtocolMisuse(
                "cursor read while no cursor is parked".into(),
            )),
        }
    }

    /// Start the next read in the background.
    fn prefetch(&mut self, count: usize) {
        self.cursor = match mem::replace(&mut self.cursor, CursorSlot::Gone) {
            CursorSlot::Parked(mut cursor) => CursorSlot::Reading(tokio::spawn(async move {
                let rows = cursor.read(count).await;
                (cursor, rows)
            })),
            other => other,
        };
    }

    /// Wait for the in-flight read.
    async fn await_read(&mut self) -> Result<Vec<RowOf<S>>> {
        match mem::replace(&mut self.cursor, CursorSlot::Gone) {
            CursorSlot::Reading(pending) => match pending.await {
                Ok((cursor, rows)) => {
                    self.cursor = CursorSlot::Parked(cursor);
                    rows
                }
                Err(e) => Err(StorageError::Worker(format!("prefetch task failed: {e}"))),
            },
            other => {
                self.cursor = other;
                Err(StorageError::ProtocolMisuse(
                    "awaited a cursor read that was never issued".into(),
                ))
            }
        }
    }

    /// Close the cursor, then release the connection. Both steps always run;
    /// the first error is returned.
    async fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        let cursor = match mem::replace(&mut self.cursor, CursorSlot::Gone) {
            CursorSlot::Parked(cursor) => Some(cursor),
            CursorSlot::Reading(pending) => match pending.await {
                Ok((cursor, _)) => Some(cursor),
                Err(e) => {
                    first_error = Some(StorageError::Worker(format!("prefetch task failed: {e}")));
                    None
                }
            },
            CursorSlot::Gone => None,
        };

        if let Some(mut cursor) = cursor {
            if let Err(e) = cursor.close().await {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => warn!(error = %e, "cursor close failed"),
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.release();
            debug!("cursor stream connection released");
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<S: ConnectionSource> Drop for CursorSession<S> {
    fn drop(&mut self) {
        if self.is_torn_down() {
            return;
        }
        let orphan = Orphan::<S> {
            connection: self.connection.take(),
            cursor: mem::replace(&mut self.cursor, CursorSlot::Gone),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("cursor stream dropped early, tearing down");
                let _ = runtime.spawn(orphan.teardown());
            }
            Err(_) => drop(orphan),
        }
    }
}

/// Resources of a session dropped before teardown.
///
/// Never spawns from `Drop`: a runtime shutting down drops spawned tasks
/// unpolled, so the connection is released right there instead.
struct Orphan<S: ConnectionSource> {
    connection: Option<ConnectionOf<S>>,
    cursor: CursorSlot<S>,
}

impl<S: ConnectionSource> Orphan<S> {
    async fn teardown(mut self) {
        let cursor = match mem::replace(&mut self.cursor, CursorSlot::Gone) {
            CursorSlot::Parked(cursor) => Some(cursor),
            CursorSlot::Reading(pending) => pending.await.ok().map(|(cursor, _)| cursor),
            CursorSlot::Gone => None,
        };
        if let Some(mut cursor) = cursor {
            if let Err(e) = cursor.close().await {
                warn!(error = %e, "cursor teardown after early drop failed");
            }
        }
        self.release();
    }

    fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release();
            debug!("cursor stream connection released");
        }
    }
}

impl<S: ConnectionSource> Drop for Orphan<S> {
    fn drop(&mut self) {
        self.cursor = CursorSlot::Gone;
        self.release();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
