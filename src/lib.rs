//! Greener: an embedded SQLite store with a single-writer group-commit batcher.
//!
//! Any number of tasks or threads submit write units. One dedicated writer
//! thread runs them back to back inside a shared transaction and commits
//! the whole batch a few milliseconds after it opened, so thousands of
//! small writes cost a handful of fsyncs. A failing unit rolls back its
//! batch: the unit gets its own error, its siblings get
//! [`Error::BatchAborted`]. Reads go straight to a pool of read-only
//! connections and never wait for the writer.
//!
//! # Example
//!
//! ```no_run
//! use greener::{Db, Execute, Query};
//! use std::time::Duration;
//!
//! # async fn demo() -> greener::Result<()> {
//! let db = Db::open_path("app.db", Duration::from_millis(3))?;
//! db.write(|tx| tx.execute_batch("CREATE TABLE IF NOT EXISTS t (v INTEGER)")).await?;
//! db.write(|tx| tx.execute("INSERT INTO t (v) VALUES (?1)", [42]).map(|_| ())).await?;
//! let count: i64 = db.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?;
//! assert_eq!(count, 1);
//! db.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`storage`]: Writer thread, transaction handle, read pool
//! - [`kv`]: Key-value store with expiry
//! - [`fts`]: Full-text search with facets
//! - [`config`]: CLI and environment configuration
//! - [`observability`]: Metrics and tracing setup

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::db::Db is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod error;
pub mod fts;
pub mod kv;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use storage::access::{Execute, Query};
pub use storage::batch::BatchConfig;
pub use storage::db::{Db, StoreConfig};
pub use storage::handle::{TxHandle, TxRow, TxRows, TxStatement};
pub use storage::pragmas::{JournalMode, LockMode, Pragmas, Synchronous, TempStore};
pub use storage::writer::WriterStats;
