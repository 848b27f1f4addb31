//! Test utilities for Greener integration tests.
//!
//! Provides:
//! - Temporary store fixtures
//! - Polling helper for writer state

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use greener::{Db, Query, StoreConfig};
use tempfile::TempDir;

/// Test fixture that owns a temporary directory and a store inside it.
///
/// The directory is removed when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for the database file
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
    pub db: Db,
}

impl TestFixture {
    /// Open a store with default settings.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Open a store with the given flush interval.
    pub fn with_flush_interval(flush_interval: Duration) -> Self {
        Self::with_config(|config| config.with_flush_interval(flush_interval))
    }

    /// Open a store after adjusting the default configuration.
    pub fn with_config(adjust: impl FnOnce(StoreConfig) -> StoreConfig) -> Self {
        greener::observability::tracing::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        let db = Db::open(adjust(StoreConfig::new(&db_path).with_reader_pool_size(4)))
            .expect("failed to open store");
        Self {
            temp_dir,
            db_path,
            db,
        }
    }

    /// Row count of `table` through the read pool.
    pub fn count(&self, table: &str) -> i64 {
        self.db
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count query failed")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met, `false` if the timeout expired.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    false
}
