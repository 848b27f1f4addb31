//! Key-value command implementation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Subcommand;
use greener::kv::{Fields, Kv, KvRow};
use greener::Db;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum KvAction {
    /// Insert or replace a value
    Put {
        pk: String,
        sk: String,
        /// JSON object of string or number fields
        value: String,
        /// Expire the row after this many seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Insert a value, failing if the key exists
    Create {
        pk: String,
        sk: String,
        /// JSON object of string or number fields
        value: String,
        /// Expire the row after this many seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Print a value
    Get { pk: String, sk: String },
    /// Remove a value
    Delete { pk: String, sk: String },
    /// List values under a partition key
    List {
        pk: String,
        /// Start at this sort key
        #[arg(long, default_value = "")]
        sk: String,
        /// Start strictly after --sk
        #[arg(long)]
        after: bool,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct RowOutput {
    pk: String,
    sk: String,
    expires: Option<u64>,
    data: Fields,
}

impl From<KvRow> for RowOutput {
    fn from(row: KvRow) -> Self {
        Self {
            pk: row.pk,
            sk: row.sk,
            expires: row.expires.map(epoch_seconds),
            data: row.data,
        }
    }
}

#[derive(Serialize)]
struct ListOutput {
    rows: Vec<RowOutput>,
    next: String,
}

fn epoch_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn parse_fields(value: &str) -> Result<Fields> {
    serde_json::from_str(value)
        .context("value must be a JSON object of string or number fields")
}

fn expiry(ttl_secs: Option<u64>) -> Option<SystemTime> {
    ttl_secs.map(|secs| SystemTime::now() + Duration::from_secs(secs))
}

pub async fn run(db: &Db, action: KvAction, format: OutputFormat) -> Result<()> {
    let kv = Kv::new(db.clone())
        .await
        .context("failed to prepare kv table")?;

    match action {
        KvAction::Put {
            pk,
            sk,
            value,
            ttl_secs,
        } => {
            kv.put(&pk, &sk, &parse_fields(&value)?, expiry(ttl_secs))
                .await?;
            report(format, "put", &pk, &sk);
        }
        KvAction::Create {
            pk,
            sk,
            value,
            ttl_secs,
        } => {
            kv.create(&pk, &sk, &parse_fields(&value)?, expiry(ttl_secs))
                .await?;
            report(format, "created", &pk, &sk);
        }
        KvAction::Get { pk, sk } => {
            let (data, expires) = kv.get(&pk, &sk)?;
            let output = RowOutput {
                pk,
                sk,
                expires: expires.map(epoch_seconds),
                data,
            };
            match format {
                OutputFormat::Text => {
                    println!("{}", serde_json::to_string(&output.data)?);
                    if let Some(expires) = output.expires {
                        println!("expires: {}", expires);
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
            }
        }
        KvAction::Delete { pk, sk } => {
            kv.delete(&pk, &sk).await?;
            report(format, "deleted", &pk, &sk);
        }
        KvAction::List {
            pk,
            sk,
            after,
            limit,
        } => {
            let (rows, next) = kv.iterate(&pk, &sk, limit, after)?;
            let output = ListOutput {
                rows: rows.into_iter().map(RowOutput::from).collect(),
                next,
            };
            match format {
                OutputFormat::Text => {
                    if output.rows.is_empty() {
                        println!("No rows found.");
                    } else {
                        println!("{:<30} {}", "SK", "DATA");
                        println!("{}", "-".repeat(62));
                        for row in &output.rows {
                            println!("{:<30} {}", row.sk, serde_json::to_string(&row.data)?);
                        }
                        println!();
                        println!("Next: {}", output.next);
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
            }
        }
    }

    Ok(())
}

fn report(format: OutputFormat, action: &str, pk: &str, sk: &str) {
    match format {
        OutputFormat::Text => println!("{} {}/{}", action, pk, sk),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "action": action, "pk": pk, "sk": sk })
        ),
    }
}
