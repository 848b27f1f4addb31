//! Dedicated writer thread with group commit.
//!
//! The writer thread exclusively owns the single writable connection. Write
//! units arrive over a bounded channel and run one at a time, in arrival
//! order, inside the currently open batch transaction:
//!
//! ```text
//! callers ──Write(unit)──▶ mpsc ──▶ writer thread
//!                                   ├─ no batch open? BEGIN (failure resolves only this unit)
//!                                   ├─ SAVEPOINT, run unit against a fresh TxHandle
//!                                   │    ok   → RELEASE, join batch, response deferred
//!                                   │    fail → ROLLBACK, unit gets its error,
//!                                   │           every other member gets BatchAborted
//!                                   └─ flush deadline → COMMIT, one outcome for all members
//! ```
//!
//! The flush deadline is armed when the first unit joins a batch, so a unit
//! waits at most `flush_interval` plus the run time of the units ahead of it.
//!
//! Each unit runs inside its own savepoint. If the savepoint is gone when the
//! unit returns, the unit ended the batch transaction (possibly opening a new
//! one) and the batch is aborted. A panicking unit is a unit failure; only the
//! handle's double-record panic takes the writer thread down.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::batch::{BatchConfig, PendingBatch};
use super::handle::{TxHandle, SECOND_ERROR_PANIC};
use super::pragmas::LockMode;
use crate::error::{Error, Result};
use crate::observability::metrics::{record_abort, record_commit, record_write_latency};

/// Default capacity of the inbound unit channel.
pub const DEFAULT_WRITE_CHANNEL_SIZE: usize = 1000;

const UNIT_SAVEPOINT: &str = "SAVEPOINT greener_unit";
const UNIT_RELEASE: &str = "RELEASE greener_unit";

type WriteFn = Box<dyn FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static>;

/// A unit of work waiting for the writer.
struct PendingUnit {
    id: Uuid,
    work: WriteFn,
    response: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
}

/// Request sent to the writer thread.
enum WriteRequest {
    Unit(PendingUnit),
    /// Stop accepting units, drain what is queued, commit, and exit.
    Shutdown,
}

/// A unit that ran successfully and awaits its batch's outcome.
struct Member {
    id: Uuid,
    response: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
}

impl Member {
    fn resolve(self, outcome: Result<()>) {
        record_write_latency(self.enqueued_at.elapsed().as_secs_f64());
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.response.send(outcome);
    }
}

/// Counters shared between the writer thread and its handles.
#[derive(Debug, Default)]
struct Counters {
    units: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    begin_failures: AtomicU64,
}

/// Snapshot of writer activity since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Units received by the writer.
    pub units: u64,
    /// Batches committed successfully.
    pub commits: u64,
    /// Batches rolled back, whether by a failing unit or a failed commit.
    pub aborts: u64,
    /// Units rejected because a transaction could not be started.
    pub begin_failures: u64,
}

/// Owner of the writer thread.
pub struct Writer {
    thread: JoinHandle<()>,
    handle: WriterHandle,
}

impl Writer {
    /// Spawn the writer thread around an already-configured connection.
    ///
    /// # Arguments
    ///
    /// * `conn` - The only writable connection; moved onto the thread
    /// * `config` - Flush timing
    /// * `lock_mode` - How each batch transaction is started
    /// * `channel_size` - Capacity of the inbound unit channel
    pub fn spawn(
        conn: Connection,
        config: BatchConfig,
        lock_mode: LockMode,
        channel_size: usize,
    ) -> Result<Self> {
        config.validate()?;
        if channel_size == 0 {
            return Err(Error::Config("write channel size must be at least 1".into()));
        }

        let (tx, rx) = mpsc::channel(channel_size);
        let counters = Arc::new(Counters::default());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Spawn)?;

        let processor = BatchProcessor {
            conn,
            batch: PendingBatch::new(config),
            begin: lock_mode.begin_statement(),
            counters: Arc::clone(&counters),
        };

        let thread = std::thread::Builder::new()
            .name("greener-writer".to_string())
            .spawn(move || runtime.block_on(processor.run(rx)))
            .map_err(Error::Spawn)?;

        tracing::debug!(
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_batch_size = ?config.max_batch_size,
            channel_size,
            "Writer thread started"
        );

        Ok(Self {
            thread,
            handle: WriterHandle { tx, counters },
        })
    }

    /// Get a handle for submitting units.
    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Wait for the writer thread to exit.
    ///
    /// The thread only exits after a shutdown request or once every handle
    /// has been dropped.
    pub fn join(self) -> Result<()> {
        let Self { thread, handle } = self;
        drop(handle);
        thread.join().map_err(|_| Error::WriterPanic)
    }
}

/// Cloneable handle for submitting write units.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
    counters: Arc<Counters>,
}

impl WriterHandle {
    fn request<F>(f: F) -> (WriteRequest, oneshot::Receiver<Result<()>>)
    where
        F: FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static,
    {
        let (response, response_rx) = oneshot::channel();
        let unit = PendingUnit {
            id: Uuid::now_v7(),
            work: Box::new(f),
            response,
            enqueued_at: Instant::now(),
        };
        (WriteRequest::Unit(unit), response_rx)
    }

    /// Submit a unit and wait until its batch is resolved.
    pub async fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static,
    {
        let (request, response_rx) = Self::request(f);
        self.tx.send(request).await.map_err(|_| Error::Closed)?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Blocking form of [`WriterHandle::write`] for threads outside any
    /// async runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<()> + Send + 'static,
    {
        let (request, response_rx) = Self::request(f);
        self.tx.blocking_send(request).map_err(|_| Error::Closed)?;
        response_rx.blocking_recv().map_err(|_| Error::Closed)?
    }

    /// Ask the writer to drain queued units, commit, and exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(WriteRequest::Shutdown)
            .await
            .map_err(|_| Error::Closed)
    }

    /// Current activity counters.
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            units: self.counters.units.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
            begin_failures: self.counters.begin_failures.load(Ordering::Relaxed),
        }
    }
}

/// State owned by the writer thread.
struct BatchProcessor {
    conn: Connection,
    batch: PendingBatch<Member>,
    begin: &'static str,
    counters: Arc<Counters>,
}

impl BatchProcessor {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteRequest>) {
        loop {
            let wait = self.batch.time_until_ready();

            tokio::select! {
                request = rx.recv() => match request {
                    Some(WriteRequest::Unit(unit)) => self.apply(unit),
                    Some(WriteRequest::Shutdown) => {
                        tracing::debug!(pending = self.batch.len(), "Writer shutdown requested");
                        // Queued units still run; recv returns None once drained.
                        rx.close();
                    }
                    None => break,
                },
                _ = tokio::time::sleep(wait.unwrap_or(Duration::ZERO)), if wait.is_some() => {
                    self.flush();
                }
            }
        }

        self.flush();
        if let Err((_, e)) = self.conn.close() {
            tracing::warn!(error = %e, "Failed to close write connection");
        }
        tracing::debug!("Writer thread stopped");
    }

    fn apply(&mut self, unit: PendingUnit) {
        self.counters.units.fetch_add(1, Ordering::Relaxed);

        if self.batch.is_empty() {
            if let Err(e) = self.conn.execute_batch(self.begin) {
                tracing::warn!(unit_id = %unit.id, error = %e, "Failed to begin batch transaction");
                self.counters.begin_failures.fetch_add(1, Ordering::Relaxed);
                let _ = unit.response.send(Err(Error::Begin(e)));
                return;
            }
        }

        let PendingUnit {
            id,
            work,
            response,
            enqueued_at,
        } = unit;

        let failure = self.run_unit(id, work);

        match failure {
            None => {
                tracing::trace!(unit_id = %id, pending = self.batch.len() + 1, "Write unit joined batch");
                let member = Member {
                    id,
                    response,
                    enqueued_at,
                };
                if self.batch.push(member) {
                    self.flush();
                }
            }
            Some(err) => self.abort(id, response, enqueued_at, err),
        }
    }

    /// Run one unit inside its own savepoint and report why it failed, if it
    /// did.
    fn run_unit(&self, id: Uuid, work: WriteFn) -> Option<Error> {
        if let Err(e) = self.conn.execute_batch(UNIT_SAVEPOINT) {
            return Some(Error::Sqlite(e));
        }

        let unhandled = {
            let handle = TxHandle::new(&self.conn);
            match panic::catch_unwind(AssertUnwindSafe(|| work(&handle))) {
                Ok(Err(e)) => return Some(e),
                Ok(Ok(())) => handle.error_message().map(str::to_string),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    if message == SECOND_ERROR_PANIC {
                        panic::resume_unwind(payload);
                    }
                    tracing::error!(unit_id = %id, panic = %message, "Write unit panicked");
                    return Some(Error::UnitPanicked(message));
                }
            }
        };

        if let Some(msg) = unhandled {
            return Some(Error::Unhandled(msg));
        }
        if self.conn.is_autocommit() {
            return Some(Error::TransactionEnded);
        }
        // Missing even if the unit opened a fresh transaction after ending ours.
        match self.conn.execute_batch(UNIT_RELEASE) {
            Ok(()) => None,
            Err(e) => {
                tracing::debug!(unit_id = %id, error = %e, "Unit savepoint no longer exists");
                Some(Error::TransactionEnded)
            }
        }
    }

    /// Roll back the open batch because `id` failed.
    fn abort(
        &mut self,
        id: Uuid,
        response: oneshot::Sender<Result<()>>,
        enqueued_at: Instant,
        err: Error,
    ) {
        // A handle that recorded a store error has already rolled back.
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, original = %err, "Failed to roll back batch");
            }
        }

        let siblings = self.batch.drain();
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        record_abort();

        tracing::debug!(
            unit_id = %id,
            error = %err,
            siblings = siblings.len(),
            "Write unit failed, batch rolled back"
        );

        let failed = Member {
            id,
            response,
            enqueued_at,
        };
        failed.resolve(Err(err));
        for member in siblings {
            member.resolve(Err(Error::BatchAborted));
        }
    }

    /// Commit the open batch, if any, and resolve every member with the
    /// single commit outcome.
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let open_for = self.batch.age().unwrap_or_default();
        let members = self.batch.drain();

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                record_commit(members.len(), open_for.as_secs_f64());
                tracing::debug!(
                    batch_size = members.len(),
                    first_unit = %members[0].id,
                    open_ms = open_for.as_secs_f64() * 1000.0,
                    "Batch committed"
                );
                for member in members {
                    member.resolve(Ok(()));
                }
            }
            Err(e) => {
                tracing::error!(batch_size = members.len(), error = %e, "Batch commit failed");
                if !self.conn.is_autocommit() {
                    if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                        tracing::warn!(error = %rollback, "Failed to roll back after commit failure");
                    }
                }
                self.counters.aborts.fetch_add(1, Ordering::Relaxed);
                record_abort();

                let shared = Arc::new(e);
                for member in members {
                    member.resolve(Err(Error::Commit(Arc::clone(&shared))));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
