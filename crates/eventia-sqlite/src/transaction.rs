//! Reference-counted transaction shared by cooperating writers.
//!
//! Every participant calls [`NestedTransaction::begin`] and later
//! [`NestedTransaction::commit`] or [`NestedTransaction::rollback`]. Only the
//! outermost commit reaches the database. The physical `BEGIN` is deferred to
//! the first executed statement, so a transaction that never writes never
//! touches a connection.
//!
//! Whoever created the handle owns it and calls [`NestedTransaction::release`]
//! once done; participants handed an existing handle never release it.

use std::fmt;
use std::sync::Arc;

use eventia_core::Logger;
use metrics::counter;
use tracing::{debug, warn};

use crate::client::{Connection, ConnectionSource, Statement};
use crate::errors::{Result, StorageError};

/// Shared transaction over a lazily acquired connection.
pub struct NestedTransaction<S: ConnectionSource> {
    source: S,
    logger: Arc<dyn Logger>,
    depth: i64,
    statements: usize,
    rolled_back: bool,
    /// A physical `BEGIN` was issued and not yet ended.
    open: bool,
    connection: Option<S::Connection>,
}

impl<S: ConnectionSource> NestedTransaction<S> {
    /// Create an idle handle. Nothing is acquired until the first statement.
    pub fn new(source: S, logger: Arc<dyn Logger>) -> Self {
        Self {
            source,
            logger,
            depth: 0,
            statements: 0,
            rolled_back: false,
            open: false,
            connection: None,
        }
    }

    /// Outstanding `begin` calls not yet matched by `commit`. Negative after
    /// an unmatched commit.
    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// Statements executed in the current physical transaction.
    pub fn statement_count(&self) -> usize {
        self.statements
    }

    /// Whether the transaction has been rolled back. Terminal.
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Whether a pooled connection is currently held.
    pub fn holds_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Enter the transaction.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_not_rolled_back("begin")?;
        self.depth += 1;
        Ok(())
    }

    /// Run a statement inside the transaction, issuing the physical `BEGIN`
    /// first if none is open yet.
    pub async fn execute(&mut self, statement: &Statement) -> Result<usize> {
        self.ensure_not_rolled_back("execute")?;
        if self.depth <= 0 {
            return Err(StorageError::ProtocolMisuse(
                "execute() called before begin()".into(),
            ));
        }

        let connection = self.open_physical().await?;
        let affected = connection.execute(statement).await?;
        self.statements += 1;
        Ok(affected)
    }

    /// Leave the transaction. The outermost commit issues the physical
    /// `COMMIT`, unless nothing was executed.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_not_rolled_back("commit")?;
        self.depth -= 1;

        if self.depth < 0 {
            self.logger
                .error("NestedTransaction::commit() called more times than begin()");
            return Ok(());
        }
        if self.depth > 0 || self.statements == 0 {
            return Ok(());
        }

        let Some(connection) = self.connection.as_mut() else {
            return Err(StorageError::ProtocolMisuse(
                "statements were executed but no connection is held".into(),
            ));
        };
        let _ = connection.execute(&Statement::new("COMMIT")).await?;
        debug!(statements = self.statements, "transaction committed");
        counter!("eventia_transactions_committed_total").increment(1);
        self.statements = 0;
        self.open = false;
        Ok(())
    }

    /// Abort the transaction for every participant. No-op if already rolled back.
    ///
    /// The handle is marked rolled back even if the physical `ROLLBACK` fails;
    /// that failure is still returned.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.rolled_back {
            return Ok(());
        }
        if self.depth <= 0 {
            self.logger
                .error("NestedTransaction::rollback() called with no active transaction");
            return Ok(());
        }

        let mut outcome = Ok(());
        if self.open {
            if let Some(connection) = self.connection.as_mut() {
                outcome = connection
                    .execute(&Statement::new("ROLLBACK"))
                    .await
                    .map(|_| ());
            }
        }
        self.open = false;
        self.rolled_back = true;
        counter!("eventia_transactions_rolled_back_total").increment(1);
        debug!(statements = self.statements, "transaction rolled back");
        outcome
    }

    /// Give the connection back to the pool. Safe to call more than once.
    ///
    /// Fails if the transaction is still active: the connection is released
    /// regardless, and any uncommitted work on it is discarded.
    pub fn release(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection.release();
            debug!("transaction connection released");
        }
        if self.depth > 0 && !self.rolled_back {
            return Err(StorageError::ProtocolMisuse(format!(
                "release() called with an active transaction (depth {})",
                self.depth
            )));
        }
        Ok(())
    }

    fn ensure_not_rolled_back(&self, operation: &str) -> Result<()> {
        if self.rolled_back {
            return Err(StorageError::ProtocolMisuse(format!(
                "{operation}() called after rollback"
            )));
        }
        Ok(())
    }

    /// Connection with a physical transaction open on it.
    async fn open_physical(&mut self) -> Result<&mut S::Connection> {
        if !self.open {
            let mut connection = match self.connection.take() {
                Some(connection) => connection,
                None => self.source.acquire().await?,
            };
            if let Err(e) = connection.execute(&Statement::new("BEGIN")).await {
                connection.release();
                return Err(e);
            }
            debug!("transaction begun");
            self.connection = Some(connection);
            self.open = true;
        }
        self.connection.as_mut().ok_or_else(|| {
            StorageError::ProtocolMisuse("transaction is open but holds no connection".into())
        })
    }
}

impl<S: ConnectionSource> Drop for NestedTransaction<S> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            warn!(depth = self.depth, "transaction dropped without release");
            connection.release();
        }
    }
}

impl<S: ConnectionSource> fmt::Debug for NestedTransaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedTransaction")
            .field("depth", &self.depth)
            .field("statements", &self.statements)
            .field("rolled_back", &self.rolled_back)
            .field("open", &self.open)
            .field("holds_connection", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
