//! Database client seam.
//!
//! The cursor stream, the nested transaction and the engine only talk to the
//! database through these traits. [`crate::sqlite`] implements them over an
//! `r2d2` pool; tests implement them with in-process fakes that count cursor
//! closes and connection releases.
//!
//! Ownership rules:
//! - a [`Connection`] is exclusively held between [`ConnectionSource::acquire`]
//!   and [`Connection::release`], which consumes it so it cannot be released twice
//! - a [`Cursor`] belongs to the connection that opened it and must be closed
//!   before that connection is released

use async_trait::async_trait;
use eventia_core::Position;
use rusqlite::types::Value;

use crate::errors::Result;

/// Statement text with positional (`$1..$n`) parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// SQL text.
    pub text: String,
    /// Parameter values, `values[i]` binds `$(i + 1)`.
    pub values: Vec<Value>,
}

impl Statement {
    /// Statement without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            values: Vec::new(),
        }
    }

    /// Statement with parameters.
    pub fn with_values(text: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            values,
        }
    }
}

/// Hands out exclusive connections. Shared by every stream and transaction,
/// so acquisition must be safe from many tasks at once.
#[async_trait]
pub trait ConnectionSource: Clone + Send + Sync + 'static {
    /// Connection type handed out.
    type Connection: Connection;

    /// Wait for a free connection.
    async fn acquire(&self) -> Result<Self::Connection>;
}

/// One exclusively held connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Server-side cursor type opened on this connection.
    type Cursor: Cursor;

    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> Result<usize>;

    /// Run a statement whose first column of the first row is a nullable position.
    async fn query_position(&mut self, statement: &Statement) -> Result<Option<Position>>;

    /// Open a cursor over a query's result set.
    async fn open_cursor(&mut self, statement: &Statement) -> Result<Self::Cursor>;

    /// Give the connection back to its pool.
    fn release(self);
}

/// Incremental reader over an open result set.
#[async_trait]
pub trait Cursor: Send + 'static {
    /// Row type produced.
    type Row: Send + 'static;

    /// Read up to `count` rows. Fewer than `count` means the result set is exhausted.
    async fn read(&mut self, count: usize) -> Result<Vec<Self::Row>>;

    /// Close the cursor, freeing its server-side state.
    async fn close(&mut self) -> Result<()>;
}
