//! greener: command-line access to a Greener store.
//!
//! # Usage
//!
//! ```bash
//! greener --db-path ./app.db kv put users alice '{"age": 30}'
//! greener --db-path ./app.db fts search 'simple AND engine'
//! greener --db-path ./bench.db bench --count 10000 --concurrency 100
//! ```
//!
//! Environment variables can also be used:
//! - `GREENER_DB_PATH`: SQLite database file
//! - `GREENER_FLUSH_INTERVAL_MS`: Batch flush interval
//! - `RUST_LOG`: Log filter (trace, debug, info, warn, error)

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use greener::config::Config;
use greener::observability::metrics::init_metrics_with_endpoint;
use greener::observability::tracing::init_tracing;
use greener::Db;

/// Command-line interface for a Greener store.
#[derive(Parser)]
#[command(name = "greener")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Key-value operations
    Kv {
        #[command(subcommand)]
        action: commands::kv::KvAction,
    },
    /// Full-text search operations
    Fts {
        #[command(subcommand)]
        action: commands::fts::FtsAction,
    },
    /// Measure write throughput with concurrent single-row inserts
    Bench {
        /// Number of inserts
        #[arg(short, long, default_value_t = 10_000)]
        count: usize,
        /// Number of concurrent writers
        #[arg(long, default_value_t = 100)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing("greener", "warn,greener=info", cli.config.log_format);
    init_metrics_with_endpoint(cli.config.otel_endpoint.as_deref());

    let db = Db::open(cli.config.store_config())
        .with_context(|| format!("failed to open {}", cli.config.db_path.display()))?;

    let outcome = match cli.command {
        Commands::Kv { action } => commands::kv::run(&db, action, cli.output).await,
        Commands::Fts { action } => commands::fts::run(&db, action, cli.output).await,
        Commands::Bench { count, concurrency } => {
            commands::bench::run(&db, count, concurrency, cli.output).await
        }
    };

    db.close().await.context("failed to close store")?;
    outcome
}
