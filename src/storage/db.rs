//! The store facade: one writer thread plus a read-only pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Params, Row};

use super::access::Query;
use super::batch::BatchConfig;
use super::handle::TxHandle;
use super::pragmas::{default_reader_pool_size, open_writer, Pragmas};
use super::reader::ReaderPool;
use super::writer::{Writer, WriterHandle, WriterStats, DEFAULT_WRITE_CHANNEL_SIZE};
use crate::error::{Error, Result};

/// Everything needed to open a [`Db`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file, created if missing.
    pub path: PathBuf,
    pub batch: BatchConfig,
    pub pragmas: Pragmas,
    /// Read pool size; defaults to the greater of 4 and the CPU count.
    pub reader_pool_size: Option<u32>,
    /// Units that may queue for the writer before `write` waits.
    pub write_channel_size: usize,
}

impl StoreConfig {
    /// Defaults for everything but the path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch: BatchConfig::default(),
            pragmas: Pragmas::default(),
            reader_pool_size: None,
            write_channel_size: DEFAULT_WRITE_CHANNEL_SIZE,
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.batch.flush_interval = flush_interval;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.batch.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn with_reader_pool_size(mut self, size: u32) -> Self {
        self.reader_pool_size = Some(size);
        self
    }
}

/// Handle to an open store. Cheap to clone; all clones share one writer.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    reader: ReaderPool,
    writer: WriterHandle,
    worker: Mutex<Option<Writer>>,
    closed: AtomicBool,
}

impl Db {
    /// Open (or create) the store described by `config`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the file cannot be opened or
    /// configured, the read pool cannot be filled, or the writer thread
    /// cannot be spawned.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.batch.validate()?;
        let pool_size = config
            .reader_pool_size
            .unwrap_or_else(default_reader_pool_size);
        if pool_size == 0 {
            return Err(Error::Config("reader pool size must be at least 1".into()));
        }

        let conn = open_writer(&config.path, &config.pragmas)?;
        let reader = ReaderPool::new(&config.path, pool_size, config.pragmas.clone())?;
        let worker = Writer::spawn(
            conn,
            config.batch,
            config.pragmas.lock_mode,
            config.write_channel_size,
        )?;

        tracing::info!(
            path = %config.path.display(),
            reader_pool_size = pool_size,
            flush_interval_ms = config.batch.flush_interval.as_millis() as u64,
            "Store opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path: config.path,
                reader,
                writer: worker.handle(),
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open with default settings and the given flush interval.
    pub fn open_path(path: impl Into<PathBuf>, flush_interval: Duration) -> Result<Self> {
        Self::open(StoreConfig::new(path).with_flush_interval(flush_interval))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Run `f` inside the current batch transaction and wait for the batch
    /// outcome.
    ///
    /// `Ok(())` means everything `f` did is durable. On failure nothing `f`
    /// did is visible; the error is `f`'s own, [`Error::BatchAborted`] if a
    /// sibling in the same batch failed, or [`Error::Commit`] if the batch
    /// could not be committed.
    pub async fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.writer.write(f).await
    }

    /// Blocking form of [`Db::write`] for threads outside any async runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.writer.blocking_write(f)
    }

    /// Run a statement on the read pool. Anything that mutates the store is
    /// refused by the read-only connection.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.ensure_open()?;
        self.inner.reader.execute(sql, params)
    }

    /// Borrow a read connection for cursor-style access.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.ensure_open()?;
        self.inner.reader.read(f)
    }

    /// Writer activity counters.
    pub fn stats(&self) -> WriterStats {
        self.inner.writer.stats()
    }

    /// Read pool state for monitoring.
    pub fn reader_state(&self) -> r2d2::State {
        self.inner.reader.state()
    }

    /// Stop accepting writes, commit whatever is queued, and wait for the
    /// writer thread to exit.
    ///
    /// Safe to call more than once and from any clone; only the first call
    /// does any work. Read connections are released when the last clone is
    /// dropped.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        // Closed here only means the writer already exited on its own.
        let _ = self.inner.writer.shutdown().await;
        let joined = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|_| Error::WriterPanic)
            .and_then(|joined| joined);
        tracing::info!(path = %self.inner.path.display(), "Store closed");
        joined
    }
}

impl Query for Db {
    fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.ensure_open()?;
        self.inner.reader.query_row(sql, params, f)
    }

    fn query_all<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.ensure_open()?;
        self.inner.reader.query_all(sql, params, f)
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
