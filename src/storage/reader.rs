//! Read connection pool for the direct read path.
//!
//! Uses r2d2 with r2d2_sqlite for pooled read access.
//! Every connection is opened read-only, so nothing on this path can
//! mutate the store behind the writer's back. SQLite WAL mode lets these
//! readers run while a batch is open; they only see committed state.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Params, Row};
use std::path::Path;

use super::pragmas::{apply_pragmas, apply_raw, Pragmas};
use crate::error::{Error, Result};

/// Read connection pool.
#[derive(Clone)]
pub struct ReaderPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReaderPool {
    /// Create a new reader pool for the given database path.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file (must already exist)
    /// * `max_size` - Maximum number of connections in the pool
    /// * `pragmas` - Pragmas applied to each connection as it is opened
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened or configured.
    /// All `max_size` connections are opened up front.
    pub fn new<P: AsRef<Path>>(db_path: P, max_size: u32, pragmas: Pragmas) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        // r2d2 retries failed connections until its timeout; probe once so a
        // bad path or pragma fails construction immediately.
        let probe = Connection::open_with_flags(db_path.as_ref(), flags).map_err(|source| {
            Error::Open {
                path: db_path.as_ref().to_path_buf(),
                source,
            }
        })?;
        apply_pragmas(&probe, &pragmas)?;
        drop(probe);

        let manager = SqliteConnectionManager::file(db_path).with_flags(flags);

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(max_size))
            .connection_customizer(Box::new(ReaderConnectionCustomizer { pragmas }))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// Run a statement that does not return rows. Mutations fail with a
    /// read-only error.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let conn = self.get()?;
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.execute(params)?)
    }

    /// Run a query expected to return exactly one row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get()?;
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.query_row(params, f)?)
    }

    /// Run a query and map every row.
    pub fn query_all<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, f)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Borrow a pooled connection for arbitrary cursor use.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.get()?;
        Ok(f(&conn)?)
    }
}

/// Connection customizer that applies pragmas to each new read connection.
#[derive(Debug)]
struct ReaderConnectionCustomizer {
    pragmas: Pragmas,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ReaderConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        apply_raw(conn, &self.pragmas).map_err(|(pragma, e)| {
            tracing::error!(pragma, error = %e, "Failed to configure read connection");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pragmas::open_writer;
    use tempfile::TempDir;

    fn seeded(temp_dir: &TempDir) -> std::path::PathBuf {
        let db_path = temp_dir.path().join("test.db");
        let conn = open_writer(&db_path, &Pragmas::default()).unwrap();
        conn.execute_batch(
            "CREATE TABLE greetings (id INTEGER PRIMARY KEY, greeting TEXT);
             INSERT INTO greetings (greeting) VALUES ('hello'), ('hi');",
        )
        .unwrap();
        db_path
    }

    #[test]
    fn test_reader_pool_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = seeded(&temp_dir);

        let pool = ReaderPool::new(&db_path, 4, Pragmas::default()).unwrap();
        assert_eq!(pool.state().connections, 4);

        let count: i64 = pool
            .query_row("SELECT COUNT(*) FROM greetings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let greetings: Vec<String> = pool
            .query_all("SELECT greeting FROM greetings ORDER BY id", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(greetings, vec!["hello", "hi"]);
    }

    #[test]
    fn test_reader_pool_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = seeded(&temp_dir);

        let pool = ReaderPool::new(&db_path, 4, Pragmas::default()).unwrap();
        let result = pool.execute("INSERT INTO greetings (greeting) VALUES (?1)", ["nope"]);
        assert!(result.is_err(), "read pool must not accept writes");

        let count: i64 = pool
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM greetings", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 2);
    }
}
