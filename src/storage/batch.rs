//! Group commit bookkeeping for the writer thread.
//!
//! A batch is the set of write units sharing one open transaction. It is
//! flushed (committed) once `flush_interval` has elapsed since the first
//! unit joined, or earlier when `max_batch_size` units are pending.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(3);

/// Configuration for batch commits.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Time between a batch opening and its commit.
    pub flush_interval: Duration,
    /// Commit early once this many units are pending.
    pub max_batch_size: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: None,
        }
    }
}

impl BatchConfig {
    /// Create a BatchConfig from application config values.
    pub fn from_config(flush_interval_ms: u64, max_batch_size: Option<usize>) -> Self {
        Self {
            flush_interval: Duration::from_millis(flush_interval_ms),
            max_batch_size,
        }
    }

    /// Reject intervals and sizes the writer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(Error::Config(
                "flush interval must be greater than zero".into(),
            ));
        }
        if self.max_batch_size == Some(0) {
            return Err(Error::Config("max batch size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Pending members of the open batch.
///
/// Empty means no transaction is open. Items are kept in arrival order.
#[derive(Debug)]
pub struct PendingBatch<T> {
    config: BatchConfig,
    items: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> PendingBatch<T> {
    /// Create an empty batch with the given configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
            opened_at: None,
        }
    }

    /// Add an item to the batch.
    ///
    /// Returns true if the batch is now ready to flush.
    pub fn push(&mut self, item: T) -> bool {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.items.push(item);
        self.is_ready()
    }

    /// Check if the batch is ready to flush.
    pub fn is_ready(&self) -> bool {
        if self.items.is_empty() {
            return false;
        }

        if let Some(max) = self.config.max_batch_size {
            if self.items.len() >= max {
                return true;
            }
        }

        self.opened_at
            .is_some_and(|start| start.elapsed() >= self.config.flush_interval)
    }

    /// Time remaining until the batch should be flushed.
    ///
    /// Returns None if the batch is empty.
    pub fn time_until_ready(&self) -> Option<Duration> {
        if self.items.is_empty() {
            return None;
        }

        if self.is_ready() {
            return Some(Duration::ZERO);
        }

        self.opened_at.map(|start| {
            self.config
                .flush_interval
                .saturating_sub(start.elapsed())
        })
    }

    /// How long the batch has been open.
    pub fn age(&self) -> Option<Duration> {
        self.opened_at.map(|start| start.elapsed())
    }

    /// Drain the batch, returning all accumulated items.
    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get the current batch size.
    pub fn len(&self) -> usize {
        self.items.len()
    }
}
