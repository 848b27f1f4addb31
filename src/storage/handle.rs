//! Transaction handle with sticky failure.
//!
//! A [`TxHandle`] wraps the write connection while a batch transaction is
//! open. It owns a single error cell. The first failing store call records
//! its error there and rolls the transaction back; from then on every call
//! on the handle, and on any statement or cursor created from it, returns
//! [`Error::TxAborted`] without touching SQLite again.
//!
//! Statements ([`TxStatement`]), cursors ([`TxRows`]) and rows ([`TxRow`])
//! borrow the handle, so they observe the same cell rather than a copy of
//! it. An abort that happens while a cursor is half-consumed is visible on
//! that cursor's next call.
//!
//! ```text
//! TxHandle ──owns──▶ error cell ◀──reads── TxStatement ◀── TxRows ◀── TxRow
//! ```
//!
//! The cell is written at most once. Recording a second error is a broken
//! caller contract and panics.

use std::cell::OnceCell;

use rusqlite::types::FromSql;
use rusqlite::{CachedStatement, Connection, Params, Row, RowIndex, Rows};

use super::access::{Execute, Query};
use crate::error::{Error, Result};

/// Panic message for the broken single-error contract. The writer lets this
/// panic take the thread down instead of treating it as a unit failure.
pub(crate) const SECOND_ERROR_PANIC: &str =
    "transaction handle recorded a second error after it was already aborted";

/// Handle given to a write unit for the duration of its execution.
pub struct TxHandle<'c> {
    conn: &'c Connection,
    error: OnceCell<String>,
}

impl<'c> TxHandle<'c> {
    /// Wrap a connection that has an open transaction.
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            error: OnceCell::new(),
        }
    }

    /// True once an error has been recorded.
    pub fn is_aborted(&self) -> bool {
        self.error.get().is_some()
    }

    /// The first recorded error, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Record a failure reported by the unit itself and roll back.
    ///
    /// Returns the error so it can be propagated with `return Err(..)`.
    ///
    /// # Panics
    ///
    /// Panics if the handle has already recorded an error.
    pub fn abort(&self, err: Error) -> Error {
        self.record(err.to_string());
        err
    }

    /// Prepare a statement inside the transaction.
    pub fn prepare(&self, sql: &str) -> Result<TxStatement<'_>> {
        self.check()?;
        match self.conn.prepare_cached(sql) {
            Ok(stmt) => Ok(TxStatement { stmt, tx: self }),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::TxAborted)
        } else {
            Ok(())
        }
    }

    /// Record a store-level error, roll back, and hand the error back.
    fn fail(&self, err: rusqlite::Error) -> Error {
        self.record(err.to_string());
        Error::Sqlite(err)
    }

    fn record(&self, message: String) {
        tracing::debug!(error = %message, "Aborting transaction");
        if self.error.set(message).is_err() {
            panic!("{}", SECOND_ERROR_PANIC);
        }

        // SQLite may already have rolled back on its own (e.g. SQLITE_FULL).
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback after failed operation failed");
            }
        }
    }
}

impl Query for TxHandle<'_> {
    fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.prepare(sql)?;
        match stmt.stmt.query_row(params, f) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn query_all<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.map(&mut f)?);
        }
        rows.close()?;
        Ok(out)
    }
}

impl Execute for TxHandle<'_> {
    fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.prepare(sql)?.execute(params)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.check()?;
        self.conn.execute_batch(sql).map_err(|e| self.fail(e))
    }

    fn last_insert_rowid(&self) -> Result<i64> {
        self.check()?;
        Ok(self.conn.last_insert_rowid())
    }
}

/// Prepared statement bound to a [`TxHandle`].
pub struct TxStatement<'h> {
    stmt: CachedStatement<'h>,
    tx: &'h TxHandle<'h>,
}

impl<'h> TxStatement<'h> {
    /// Execute the statement, returning the number of rows changed.
    pub fn execute<P: Params>(&mut self, params: P) -> Result<usize> {
        self.tx.check()?;
        self.stmt.execute(params).map_err(|e| self.tx.fail(e))
    }

    /// Start a cursor over the statement's rows.
    pub fn query<P: Params>(&mut self, params: P) -> Result<TxRows<'_>> {
        self.tx.check()?;
        let tx = self.tx;
        match self.stmt.query(params) {
            Ok(rows) => Ok(TxRows { rows, tx }),
            Err(e) => Err(tx.fail(e)),
        }
    }
}

/// Cursor over rows produced inside a transaction.
pub struct TxRows<'s> {
    rows: Rows<'s>,
    tx: &'s TxHandle<'s>,
}

impl<'s> TxRows<'s> {
    /// Advance to the next row. `Ok(None)` once the cursor is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<TxRow<'_, 's>>> {
        self.tx.check()?;
        let tx = self.tx;
        match self.rows.next() {
            Ok(Some(row)) => Ok(Some(TxRow { row, tx })),
            Ok(None) => Ok(None),
            Err(e) => Err(tx.fail(e)),
        }
    }

    /// Release the cursor, reporting whether the transaction is still live.
    pub fn close(self) -> Result<()> {
        self.tx.check()
    }

    /// Sticky state of the owning transaction.
    pub fn err(&self) -> Result<()> {
        self.tx.check()
    }
}

/// One row of a [`TxRows`] cursor.
pub struct TxRow<'r, 's> {
    row: &'r Row<'s>,
    tx: &'r TxHandle<'r>,
}

impl TxRow<'_, '_> {
    /// Read one column. A conversion failure aborts the transaction.
    pub fn get<I: RowIndex, T: FromSql>(&self, idx: I) -> Result<T> {
        self.tx.check()?;
        self.row.get(idx).map_err(|e| self.tx.fail(e))
    }

    /// Map the whole row. A mapping failure aborts the transaction.
    pub fn map<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.tx.check()?;
        f(self.row).map_err(|e| self.tx.fail(e))
    }
}
