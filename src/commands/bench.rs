//! Write throughput benchmark.

use std::time::Instant;

use anyhow::{Context, Result};
use greener::{Db, Execute};
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct BenchOutput {
    count: usize,
    concurrency: usize,
    elapsed_ms: f64,
    writes_per_second: f64,
    commits: u64,
    aborts: u64,
}

pub async fn run(db: &Db, count: usize, concurrency: usize, format: OutputFormat) -> Result<()> {
    let concurrency = concurrency.clamp(1, count.max(1));

    db.write(|tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS bench (id INTEGER PRIMARY KEY, writer INTEGER, payload TEXT)",
        )
    })
    .await
    .context("failed to create bench table")?;

    let before = db.stats();
    let start = Instant::now();

    // Writers take turns on indices so the total is exactly `count`.
    let handles: Vec<_> = (0..concurrency)
        .map(|writer| {
            let db = db.clone();
            tokio::spawn(async move {
                for _ in (writer..count).step_by(concurrency) {
                    db.write(move |tx| {
                        tx.execute(
                            "INSERT INTO bench (writer, payload) VALUES (?1, ?2)",
                            (writer as i64, "x".repeat(64)),
                        )?;
                        Ok(())
                    })
                    .await?;
                }
                Ok::<_, greener::Error>(())
            })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        joined.context("bench writer panicked")??;
    }

    let elapsed = start.elapsed();
    let after = db.stats();
    let output = BenchOutput {
        count,
        concurrency,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        writes_per_second: count as f64 / elapsed.as_secs_f64(),
        commits: after.commits - before.commits,
        aborts: after.aborts - before.aborts,
    };

    match format {
        OutputFormat::Text => {
            println!("Benchmark results:");
            println!("  Writes:      {}", output.count);
            println!("  Concurrency: {}", output.concurrency);
            println!("  Duration:    {:?}", elapsed);
            println!("  Throughput:  {:.2} writes/s", output.writes_per_second);
            println!("  Commits:     {}", output.commits);
            if output.commits > 0 {
                println!(
                    "  Batch size:  {:.1} writes/commit",
                    output.count as f64 / output.commits as f64
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
    }

    Ok(())
}
