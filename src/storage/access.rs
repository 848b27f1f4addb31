//! Capability traits for store access.
//!
//! [`Query`] is the read capability, implemented by the direct read path
//! ([`crate::Db`]) and by the transaction handle given to write units.
//! [`Execute`] is the write capability and only the handle implements it,
//! so mutating calls are only reachable from inside a write unit.

use rusqlite::{Params, Row};

use crate::error::Result;

/// Read capability.
pub trait Query {
    /// Run a query expected to return exactly one row and map it.
    fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>;

    /// Run a query and map every row it returns.
    fn query_all<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>;
}

/// Write capability, available inside a write unit.
pub trait Execute: Query {
    /// Execute one statement with positional parameters, returning the
    /// number of rows changed.
    fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize>;

    /// Execute a sequence of parameterless statements.
    fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Rowid of the most recent successful insert on this connection.
    fn last_insert_rowid(&self) -> Result<i64>;
}
