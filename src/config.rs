//! Store configuration for the `greener` binary.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Defaults matching [`StoreConfig::new`]

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::observability::tracing::LogFormat;
use crate::storage::batch::BatchConfig;
use crate::storage::db::StoreConfig;
use crate::storage::pragmas::Pragmas;
use crate::storage::writer::DEFAULT_WRITE_CHANNEL_SIZE;

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// SQLite database file (created if missing)
    #[arg(short, long, env = "GREENER_DB_PATH", default_value = "./greener.db")]
    pub db_path: PathBuf,

    /// Milliseconds a batch stays open before it is committed
    #[arg(long, env = "GREENER_FLUSH_INTERVAL_MS", default_value_t = 3)]
    pub flush_interval_ms: u64,

    /// Commit early once this many units are pending
    #[arg(long, env = "GREENER_MAX_BATCH_SIZE")]
    pub max_batch_size: Option<usize>,

    /// Size of the read connection pool (default: max(4, CPU count))
    #[arg(long, env = "GREENER_READER_POOL_SIZE")]
    pub reader_pool_size: Option<u32>,

    /// Size of the write channel (backpressure control)
    #[arg(long, env = "GREENER_WRITE_CHANNEL_SIZE", default_value_t = DEFAULT_WRITE_CHANNEL_SIZE)]
    pub write_channel_size: usize,

    /// Milliseconds to wait on a locked database before failing
    #[arg(long, env = "GREENER_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// Log format (text, json)
    #[arg(long, env = "GREENER_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Translate into the library's store configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db_path.clone(),
            batch: BatchConfig::from_config(self.flush_interval_ms, self.max_batch_size),
            pragmas: Pragmas {
                busy_timeout: Duration::from_millis(self.busy_timeout_ms),
                ..Pragmas::default()
            },
            reader_pool_size: self.reader_pool_size,
            write_channel_size: self.write_channel_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./greener.db"),
            flush_interval_ms: 3,
            max_batch_size: None,
            reader_pool_size: None,
            write_channel_size: DEFAULT_WRITE_CHANNEL_SIZE,
            busy_timeout_ms: 5000,
            log_format: LogFormat::Text,
            otel_endpoint: None,
        }
    }
}
