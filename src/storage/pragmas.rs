//! Connection setup shared by the write connection and the read pool.
//!
//! Every connection, writable or not, gets the same [`Pragmas`] applied once
//! at open time. The write connection is opened here; read connections are
//! opened by [`super::reader::ReaderPool`] and configured through an r2d2
//! customizer that calls back into this module.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};

/// SQLite journaling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Memory => "MEMORY",
            Self::Wal => "WAL",
            Self::Off => "OFF",
        })
    }
}

/// SQLite `synchronous` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

impl fmt::Display for Synchronous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Extra => "EXTRA",
        })
    }
}

/// Where SQLite keeps temporary tables and indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempStore {
    Default,
    File,
    Memory,
}

impl fmt::Display for TempStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "DEFAULT",
            Self::File => "FILE",
            Self::Memory => "MEMORY",
        })
    }
}

/// How the batch transaction acquires its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl LockMode {
    /// The statement that opens a transaction in this mode.
    pub fn begin_statement(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Named pragmas applied identically to every opened connection.
#[derive(Debug, Clone)]
pub struct Pragmas {
    pub journal_mode: JournalMode,
    pub busy_timeout: Duration,
    pub synchronous: Synchronous,
    /// Page cache size, in pages when positive and KiB when negative.
    pub cache_size: i64,
    pub foreign_keys: bool,
    pub temp_store: TempStore,
    pub lock_mode: LockMode,
}

impl Default for Pragmas {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout: Duration::from_millis(5000),
            synchronous: Synchronous::Normal,
            cache_size: 1_000_000_000,
            foreign_keys: true,
            temp_store: TempStore::Memory,
            lock_mode: LockMode::Immediate,
        }
    }
}

impl Pragmas {
    /// `PRAGMA name = value` assignments, in application order.
    fn assignments(&self) -> [(&'static str, String); 5] {
        [
            ("journal_mode", self.journal_mode.to_string()),
            ("synchronous", self.synchronous.to_string()),
            ("cache_size", self.cache_size.to_string()),
            (
                "foreign_keys",
                if self.foreign_keys { "ON" } else { "OFF" }.to_string(),
            ),
            ("temp_store", self.temp_store.to_string()),
        ]
    }
}

/// Apply pragmas, reporting the name of the first one that failed.
pub(crate) fn apply_raw(
    conn: &Connection,
    pragmas: &Pragmas,
) -> std::result::Result<(), (&'static str, rusqlite::Error)> {
    conn.busy_timeout(pragmas.busy_timeout)
        .map_err(|e| ("busy_timeout", e))?;

    for (pragma, value) in pragmas.assignments() {
        // execute_batch tolerates pragmas that echo their new value as a row
        conn.execute_batch(&format!("PRAGMA {pragma} = {value}"))
            .map_err(|e| (pragma, e))?;
    }
    Ok(())
}

/// Apply pragmas to a connection.
pub fn apply_pragmas(conn: &Connection, pragmas: &Pragmas) -> Result<()> {
    apply_raw(conn, pragmas).map_err(|(pragma, source)| Error::Pragma { pragma, source })
}

/// Open the single writable connection and configure it.
///
/// The file is created if missing. The connection is meant to be moved
/// onto the writer thread and never shared.
pub fn open_writer(path: &Path, pragmas: &Pragmas) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;

    apply_pragmas(&conn, pragmas)?;
    Ok(conn)
}

/// Default read pool size: the greater of 4 and the available parallelism.
pub fn default_reader_pool_size() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    u32::try_from(cpus.max(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_writer_applies_pragmas() {
        let temp_dir = TempDir::new().unwrap();
        let conn = open_writer(&temp_dir.path().join("test.db"), &Pragmas::default()).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let sync: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1); // NORMAL

        let temp: i64 = conn
            .query_row("PRAGMA temp_store", [], |row| row.get(0))
            .unwrap();
        assert_eq!(temp, 2); // MEMORY
    }

    #[test]
    fn test_open_writer_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing").join("test.db");

        let err = open_writer(&path, &Pragmas::default()).unwrap_err();
        assert!(matches!(err, Error::Open { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_default_reader_pool_size_floor() {
        assert!(default_reader_pool_size() >= 4);
    }

    #[test]
    fn test_begin_statement() {
        assert_eq!(LockMode::Immediate.begin_statement(), "BEGIN IMMEDIATE");
        assert_eq!(LockMode::Deferred.begin_statement(), "BEGIN DEFERRED");
    }
}
