//! Key-value store on top of [`Db`].
//!
//! Rows live in a single `kv` table keyed by `(pk, sk)`. Values are flat
//! maps of numbers and strings stored as JSON. A row may carry an expiry
//! time; expired rows are invisible to reads and removed by the cleanup
//! task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::storage::access::Execute;
use crate::storage::db::Db;

/// How often expired rows are purged unless configured otherwise.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS kv (
    pk TEXT NOT NULL,
    sk TEXT NOT NULL,
    data JSON NOT NULL,
    expires INTEGER,
    PRIMARY KEY (pk, sk)
)";

/// A single value: a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// The value stored under a key.
pub type Fields = BTreeMap<String, Scalar>;

/// A row returned by [`Kv::iterate`].
#[derive(Debug, Clone, PartialEq)]
pub struct KvRow {
    pub pk: String,
    pub sk: String,
    pub expires: Option<SystemTime>,
    pub data: Fields,
}

/// Serialize a value for the `data` column. JSON has no NaN or infinity, so
/// those are refused rather than stored as `null`.
fn encode(data: &Fields) -> Result<String> {
    if let Some((field, _)) = data
        .iter()
        .find(|(_, v)| matches!(v, Scalar::Number(n) if !n.is_finite()))
    {
        return Err(Error::NonFiniteNumber {
            field: field.clone(),
        });
    }
    Ok(serde_json::to_string(data)?)
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

fn from_unix_seconds(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn now() -> i64 {
    unix_seconds(SystemTime::now())
}

/// Key-value store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Kv {
    db: Db,
}

impl Kv {
    /// Create the `kv` table if needed.
    pub async fn new(db: Db) -> Result<Self> {
        db.write(|tx| tx.execute_batch(CREATE_TABLE)).await?;
        Ok(Self { db })
    }

    /// Insert or replace the row at `(pk, sk)`.
    pub async fn put(
        &self,
        pk: &str,
        sk: &str,
        data: &Fields,
        expires: Option<SystemTime>,
    ) -> Result<()> {
        let (pk, sk) = (pk.to_string(), sk.to_string());
        let json = encode(data)?;
        let expires = expires.map(unix_seconds);

        self.db
            .write(move |tx| {
                tx.execute(
                    "INSERT INTO kv (pk, sk, data, expires) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(pk, sk) DO UPDATE SET data = excluded.data, expires = excluded.expires",
                    params![pk, sk, json, expires],
                )?;
                Ok(())
            })
            .await
    }

    /// Insert the row at `(pk, sk)`, failing with [`Error::AlreadyExists`]
    /// if it is already present.
    ///
    /// The conflict does not fail the write unit, so other units sharing
    /// the batch still commit.
    pub async fn create(
        &self,
        pk: &str,
        sk: &str,
        data: &Fields,
        expires: Option<SystemTime>,
    ) -> Result<()> {
        let json = encode(data)?;
        let expires = expires.map(unix_seconds);
        let inserted = Arc::new(AtomicBool::new(false));

        {
            let (pk, sk) = (pk.to_string(), sk.to_string());
            let inserted = Arc::clone(&inserted);
            self.db
                .write(move |tx| {
                    let changed = tx.execute(
                        "INSERT INTO kv (pk, sk, data, expires) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(pk, sk) DO NOTHING",
                        params![pk, sk, json, expires],
                    )?;
                    inserted.store(changed > 0, Ordering::Release);
                    Ok(())
                })
                .await?;
        }

        if !inserted.load(Ordering::Acquire) {
            return Err(Error::AlreadyExists {
                pk: pk.to_string(),
                sk: sk.to_string(),
            });
        }
        Ok(())
    }

    /// Fetch the live row at `(pk, sk)` from the read pool.
    pub fn get(&self, pk: &str, sk: &str) -> Result<(Fields, Option<SystemTime>)> {
        let found = self.db.read(|conn| {
            conn.query_row(
                "SELECT data, expires FROM kv
                 WHERE pk = ?1 AND sk = ?2 AND (expires IS NULL OR expires > ?3)",
                params![pk, sk, now()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()
        })?;

        let Some((json, expires)) = found else {
            return Err(Error::KeyNotFound {
                pk: pk.to_string(),
                sk: sk.to_string(),
            });
        };
        Ok((serde_json::from_str(&json)?, expires.map(from_unix_seconds)))
    }

    /// Remove the row at `(pk, sk)`. Removing a missing row is not an error.
    pub async fn delete(&self, pk: &str, sk: &str) -> Result<()> {
        let (pk, sk) = (pk.to_string(), sk.to_string());
        self.db
            .write(move |tx| {
                tx.execute("DELETE FROM kv WHERE pk = ?1 AND sk = ?2", params![pk, sk])?;
                Ok(())
            })
            .await
    }

    /// List live rows under `pk` in sort key order.
    ///
    /// With a non-empty `sk`, rows start at `sk` (or strictly after it when
    /// `after` is set). Returns at most `limit` rows and the cursor to pass
    /// as `sk` with `after = true` for the next page: the last sort key
    /// returned, or `sk` itself when the page is empty.
    pub fn iterate(
        &self,
        pk: &str,
        sk: &str,
        limit: usize,
        after: bool,
    ) -> Result<(Vec<KvRow>, String)> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        // Every sort key is >= "", so an empty start key lists from the top.
        let sql = if after && !sk.is_empty() {
            "SELECT pk, sk, data, expires FROM kv
             WHERE pk = ?1 AND sk > ?2 AND (expires IS NULL OR expires > ?3)
             ORDER BY sk ASC LIMIT ?4"
        } else {
            "SELECT pk, sk, data, expires FROM kv
             WHERE pk = ?1 AND sk >= ?2 AND (expires IS NULL OR expires > ?3)
             ORDER BY sk ASC LIMIT ?4"
        };

        let raw = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![pk, sk, now(), limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let rows = raw
            .into_iter()
            .map(|(pk, sk, json, expires)| -> Result<KvRow> {
                Ok(KvRow {
                    pk,
                    sk,
                    expires: expires.map(from_unix_seconds),
                    data: serde_json::from_str(&json)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let next = rows
            .last()
            .map_or_else(|| sk.to_string(), |row| row.sk.clone());
        Ok((rows, next))
    }

    /// Delete every row whose expiry has passed. Returns how many went.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        let cutoff = now();

        self.db
            .write(move |tx| {
                let n = tx.execute(
                    "DELETE FROM kv WHERE expires IS NOT NULL AND expires <= ?1",
                    params![cutoff],
                )?;
                counter.store(n, Ordering::Release);
                Ok(())
            })
            .await?;

        Ok(removed.load(Ordering::Acquire))
    }

    /// Spawn a task that purges expired rows every `interval`.
    ///
    /// Failures are logged and the task keeps running. Must be called from
    /// within a tokio runtime.
    pub fn start_cleanup(&self, interval: Duration) -> CleanupTask {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let kv = self.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => match kv.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Purged expired rows"),
                        Err(Error::Closed) => {
                            tracing::debug!("Store closed, stopping cleanup");
                            break;
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to purge expired rows"),
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        CleanupTask { token, handle }
    }
}

/// Handle to the background cleanup task.
#[derive(Debug)]
pub struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Cleanup task ended abnormally");
        }
    }
}
