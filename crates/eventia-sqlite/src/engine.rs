//! Event storage engine.
//!
//! [`SqliteEventStorageEngine`] composes the query compiler, the cursor stream
//! and the nested transaction into the operations the event-sourcing core
//! calls: append, read, and token derivation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use eventia_core::{DomainEventMessage, Logger, Position, ReadMode, ResumptionToken, TrackedDomainEventMessage};
use eventia_settings::StorageSettings;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use rusqlite::types::Value;
use tracing::{debug, info, warn};

use crate::client::{Connection, ConnectionSource, Statement};
use crate::cursor::{BatchCursorStream, DEFAULT_BATCH_SIZE, RowOf};
use crate::errors::{Result, StorageError};
use crate::query::EventQuery;
use crate::sqlite::connection::{ConnectionConfig, new_file, verify_pragmas};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::row_types::StoredEventRow;
use crate::sqlite::worker::SqliteConnectionSource;
use crate::transaction::NestedTransaction;

const APPEND_COLUMNS: &str =
    "Id, AggregateIdentifier, SequenceNumber, AggregateType, PayloadType, Payload, Metadata";
const VALUES_PER_EVENT: usize = 7;
/// Bound parameters per statement allowed by bundled `SQLite`.
const MAX_PARAMETERS: usize = 32_766;

/// Event store over any [`ConnectionSource`], `SQLite` by default.
pub struct SqliteEventStorageEngine<S: ConnectionSource = SqliteConnectionSource> {
    source: S,
    logger: Arc<dyn Logger>,
    batch_size: usize,
}

impl SqliteEventStorageEngine<SqliteConnectionSource> {
    /// Open the database from settings: build the pool and apply migrations.
    pub fn open(settings: &StorageSettings, logger: Arc<dyn Logger>) -> Result<Self> {
        settings.validate()?;

        if let Some(parent) = Path::new(&settings.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let pool = new_file(&settings.database_path, &ConnectionConfig::from(&settings.pool))?;
        let conn = pool.get()?;
        let applied = run_migrations(&conn)?;
        let pragmas = verify_pragmas(&conn)?;
        drop(conn);
        info!(
            path = %settings.database_path,
            pool_size = settings.pool.size,
            journal_mode = %pragmas.journal_mode,
            applied,
            "event storage opened"
        );

        Ok(Self::new(
            SqliteConnectionSource::new(pool),
            logger,
            settings.read.batch_size,
        ))
    }
}

impl<S: ConnectionSource> SqliteEventStorageEngine<S> {
    /// Engine over an existing connection source. A zero batch size falls
    /// back to [`DEFAULT_BATCH_SIZE`].
    pub fn new(source: S, logger: Arc<dyn Logger>, batch_size: usize) -> Self {
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        Self {
            source,
            logger,
            batch_size,
        }
    }

    /// The connection source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Rows per cursor read.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// A fresh transaction handle, owned by the caller.
    pub fn create_transaction(&self) -> NestedTransaction<S> {
        NestedTransaction::new(self.source.clone(), Arc::clone(&self.logger))
    }

    /// Append events in one `INSERT`.
    ///
    /// With `transaction`, the append joins it and the caller stays
    /// responsible for releasing it. Without, a transaction is created,
    /// committed and released here. On failure the transaction is rolled back
    /// and the original error returned. An empty batch does nothing.
    ///
    /// One append carries at most 4680 events (seven bound values each);
    /// larger batches fail with [`StorageError::InvalidArgument`] before any I/O.
    pub async fn append_events<I>(
        &self,
        events: I,
        transaction: Option<&mut NestedTransaction<S>>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = DomainEventMessage>,
    {
        let events: Vec<DomainEventMessage> = events.into_iter().collect();
        if events.is_empty() {
            return Ok(());
        }
        let statement = build_append_statement(&events)?;

        let mut local: NestedTransaction<S>;
        let (transaction, owned) = match transaction {
            Some(shared) => (shared, false),
            None => {
                local = self.create_transaction();
                (&mut local, true)
            }
        };

        let outcome = run_append(transaction, &statement).await;
        if let Err(e) = &outcome {
            self.logger
                .error(&format!("appending {} events failed: {e}", events.len()));
            if let Err(rollback) = transaction.rollback().await {
                warn!(error = %rollback, "rollback after failed append also failed");
            }
        }

        let released = if owned { transaction.release() } else { Ok(()) };
        outcome?;
        released?;

        counter!("eventia_events_appended_total").increment(events.len() as u64);
        debug!(count = events.len(), owned, "events appended");
        Ok(())
    }

    /// Read historical events after `token`; `None` reads from the start.
    pub fn read_events(
        &self,
        token: Option<&ResumptionToken>,
        mode: ReadMode,
    ) -> Result<EventStream<S>>
    where
        RowOf<S>: Into<StoredEventRow>,
    {
        self.read_query(&EventQuery::from_token(token), mode)
    }

    /// Read historical events matching a custom query.
    pub fn read_query(&self, query: &EventQuery, mode: ReadMode) -> Result<EventStream<S>>
    where
        RowOf<S>: Into<StoredEventRow>,
    {
        if mode == ReadMode::Live {
            return Err(StorageError::UnsupportedMode(
                "live event tailing is not supported; only historical reads".into(),
            ));
        }
        let statement = query.build()?;
        debug!(sql = %statement.text, "reading events");
        let rows = BatchCursorStream::new(self.source.clone(), statement, self.batch_size, mode)?;
        Ok(EventStream { rows })
    }

    /// Token for the start of the log.
    pub fn create_head_token(&self) -> ResumptionToken {
        ResumptionToken::head()
    }

    /// Token for the last stored event, or the head token when empty.
    pub async fn create_tail_token(&self) -> Result<ResumptionToken> {
        let max = self
            .query_position(Statement::new(
                "SELECT MAX(Position) AS position FROM Events",
            ))
            .await?;
        Ok(max.map_or_else(|| self.create_head_token(), ResumptionToken::Positional))
    }

    /// Token for the first event logged at or after `at`, or the tail token
    /// when there is none.
    pub async fn create_token_at(&self, at: DateTime<Utc>) -> Result<ResumptionToken> {
        let bound = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let min = self
            .query_position(Statement::with_values(
                "SELECT MIN(Position) AS position FROM Events WHERE LogDate >= $1",
                vec![Value::Text(bound)],
            ))
            .await?;
        match min {
            Some(position) => Ok(ResumptionToken::Positional(position)),
            None => self.create_tail_token().await,
        }
    }

    /// Token for the first event logged within the last `duration`.
    pub async fn create_token_since(&self, duration: Duration) -> Result<ResumptionToken> {
        let delta = TimeDelta::from_std(duration)
            .map_err(|e| StorageError::InvalidArgument(format!("duration out of range: {e}")))?;
        let at = Utc::now()
            .checked_sub_signed(delta)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.create_token_at(at).await
    }

    async fn query_position(&self, statement: Statement) -> Result<Option<Position>> {
        let mut connection = self.source.acquire().await?;
        let position = connection.query_position(&statement).await;
        connection.release();
        position
    }
}

impl<S: ConnectionSource> fmt::Debug for SqliteEventStorageEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteEventStorageEngine")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

async fn run_append<S: ConnectionSource>(
    transaction: &mut NestedTransaction<S>,
    statement: &Statement,
) -> Result<()> {
    transaction.begin()?;
    let _ = transaction.execute(statement).await?;
    transaction.commit().await
}

/// One multi-row `INSERT` with a seven-value block per event.
fn build_append_statement(events: &[DomainEventMessage]) -> Result<Statement> {
    if events.len() > MAX_PARAMETERS / VALUES_PER_EVENT {
        return Err(StorageError::InvalidArgument(format!(
            "cannot append {} events in one statement; the limit is {}",
            events.len(),
            MAX_PARAMETERS / VALUES_PER_EVENT
        )));
    }
    let mut tuples = Vec::with_capacity(events.len());
    let mut values = Vec::with_capacity(events.len() * VALUES_PER_EVENT);

    for event in events {
        let first = values.len() + 1;
        let slots: Vec<String> = (first..first + VALUES_PER_EVENT)
            .map(|slot| format!("${slot}"))
            .collect();
        tuples.push(format!("({})", slots.join(", ")));

        let metadata = match &event.metadata {
            Some(map) => serde_json::to_string(map)?,
            None => "{}".to_string(),
        };
        values.extend([
            Value::Text(event.identifier.clone()),
            Value::Text(event.aggregate_identifier.clone()),
            Value::Integer(event.sequence_number),
            Value::Text(event.aggregate_type.clone()),
            Value::Text(event.payload_type.clone()),
            Value::Text(serde_json::to_string(&event.payload)?),
            Value::Text(metadata),
        ]);
    }

    Ok(Statement::with_values(
        format!("INSERT INTO Events ({APPEND_COLUMNS}) VALUES {}", tuples.join(",")),
        values,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Event stream
// ─────────────────────────────────────────────────────────────────────────────

/// Stream of tracked events read from storage.
pub struct EventStream<S: ConnectionSource> {
    rows: BatchCursorStream<S>,
}

impl<S: ConnectionSource> EventStream<S>
where
    RowOf<S>: Into<StoredEventRow>,
{
    /// Next event, or `None` once the read is complete. A row that cannot be
    /// converted ends the stream with its error.
    pub async fn next_event(&mut self) -> Option<Result<TrackedDomainEventMessage>> {
        let row: StoredEventRow = match self.rows.next_row().await? {
            Ok(row) => row.into(),
            Err(e) => return Some(Err(e)),
        };
        let converted = row.into_tracked_message();
        if let Err(e) = &converted {
            warn!(error = %e, "stored event could not be read, closing stream");
            if let Err(close) = self.rows.close().await {
                warn!(error = %close, "closing event stream failed");
            }
        }
        Some(converted)
    }

    /// Stop reading early.
    pub async fn close(&mut self) -> Result<()> {
        self.rows.close().await
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> BoxStream<'static, Result<TrackedDomainEventMessage>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_event().await.map(|item| (item, stream))
        })
        .boxed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
