//! Integration tests for the write batcher.
//!
//! Tests:
//! - Concurrent units are group committed
//! - A failing unit aborts its whole batch
//! - Batches are invisible to readers until committed
//! - Begin and commit failures reach the right units
//! - Units that end the transaction or panic abort only their batch
//! - Close drains pending work and refuses later calls

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{wait_for, TestFixture};
use futures::future::join_all;
use greener::{Db, Error, Execute, Pragmas, Query, StoreConfig};
use rusqlite::params;

async fn create_items(db: &Db) {
    db.write(|tx| {
        tx.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
    })
    .await
    .expect("create table failed");
}

async fn insert(db: &Db, name: &str) -> greener::Result<()> {
    let name = name.to_string();
    db.write(move |tx| {
        tx.execute("INSERT INTO items (name) VALUES (?1)", params![name])?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_share_commits() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(10));
    create_items(&fixture.db).await;
    let before = fixture.db.stats();

    let writes = (0..1000).map(|i| {
        let db = fixture.db.clone();
        async move { insert(&db, &format!("item-{i}")).await }
    });
    let results = join_all(writes).await;

    assert!(results.iter().all(Result::is_ok), "every write should succeed");
    assert_eq!(fixture.count("items"), 1000);

    let stats = fixture.db.stats();
    let commits = stats.commits - before.commits;
    println!("1000 writes took {commits} commits");
    assert!(commits >= 1);
    assert!(commits < 100, "expected group commit, got {commits} commits");
    assert_eq!(stats.aborts, 0);
}

#[tokio::test]
async fn test_failing_unit_aborts_its_batch() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(200));
    create_items(&fixture.db).await;
    let db = &fixture.db;

    let (a, b, c) = tokio::join!(
        insert(db, "a"),
        insert(db, "b"),
        db.write(|tx| {
            tx.execute("INSERT INTO items (name) VALUES ('c')", [])?;
            Err(Error::rejected("unit c changed its mind"))
        }),
    );

    assert!(matches!(a, Err(Error::BatchAborted)), "a: {a:?}");
    assert!(matches!(b, Err(Error::BatchAborted)), "b: {b:?}");
    match c {
        Err(Error::Rejected(msg)) => assert_eq!(msg, "unit c changed its mind"),
        other => panic!("c should see its own error, got {other:?}"),
    }
    assert_eq!(fixture.count("items"), 0);

    // The next batch starts clean.
    insert(db, "a").await.unwrap();
    assert_eq!(fixture.count("items"), 1);
}

#[tokio::test]
async fn test_store_error_aborts_batch_and_later_units_commit() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(200));
    create_items(&fixture.db).await;
    insert(&fixture.db, "taken").await.unwrap();
    let db = &fixture.db;

    let (first, duplicate) = tokio::join!(insert(db, "fresh"), insert(db, "taken"));
    assert!(matches!(first, Err(Error::BatchAborted)), "first: {first:?}");
    assert!(
        matches!(duplicate, Err(Error::Sqlite(_))),
        "duplicate: {duplicate:?}"
    );

    let names: Vec<String> = db
        .query_all("SELECT name FROM items ORDER BY name", [], |row| row.get(0))
        .unwrap();
    assert_eq!(names, vec!["taken"]);
}

#[tokio::test]
async fn test_unit_restarting_transaction_aborts_batch() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(200));
    create_items(&fixture.db).await;
    let db = &fixture.db;

    let (sibling, restarter) = tokio::join!(
        insert(db, "a"),
        db.write(|tx| tx.execute_batch("ROLLBACK; BEGIN IMMEDIATE")),
    );
    assert!(matches!(sibling, Err(Error::BatchAborted)), "sibling: {sibling:?}");
    assert!(
        matches!(restarter, Err(Error::TransactionEnded)),
        "restarter: {restarter:?}"
    );
    assert_eq!(fixture.count("items"), 0);

    // Acknowledged units are durable again once the batch is clean.
    insert(db, "a").await.unwrap();
    assert_eq!(fixture.count("items"), 1);
}

#[tokio::test]
async fn test_unit_sees_sticky_error_after_failure() {
    let fixture = TestFixture::new();
    create_items(&fixture.db).await;

    let observed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&observed);
    let result = fixture
        .db
        .write(move |tx| {
            let first = tx.execute("INSERT INTO nowhere VALUES (1)", []);
            assert!(matches!(first, Err(Error::Sqlite(_))));
            assert!(tx.is_aborted());

            // Everything after the failure is refused without touching SQLite.
            let second = tx.execute("INSERT INTO items (name) VALUES ('x')", []);
            assert!(matches!(second, Err(Error::TxAborted)));
            let read = tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get::<_, i64>(0));
            assert!(matches!(read, Err(Error::TxAborted)));
            seen.fetch_add(1, Ordering::SeqCst);

            first.map(|_| ())
        })
        .await;

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(Error::Sqlite(_))));
    assert_eq!(fixture.count("items"), 0);
}

#[tokio::test]
async fn test_cursor_iteration_inside_unit() {
    let fixture = TestFixture::new();
    create_items(&fixture.db).await;
    for name in ["a", "b", "c"] {
        insert(&fixture.db, name).await.unwrap();
    }

    fixture
        .db
        .write(|tx| {
            let mut stmt = tx.prepare("SELECT name FROM items ORDER BY name")?;
            let mut rows = stmt.query([])?;
            let mut upper = Vec::new();
            while let Some(row) = rows.next()? {
                upper.push(row.get::<_, String>(0)?.to_uppercase());
            }
            rows.close()?;
            drop(stmt);

            for name in upper {
                tx.execute("INSERT INTO items (name) VALUES (?1)", params![name])?;
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(fixture.count("items"), 6);
}

#[tokio::test]
async fn test_uncommitted_batch_is_invisible_to_readers() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(300));
    create_items(&fixture.db).await;
    let before = fixture.db.stats().units;

    let pending = {
        let db = fixture.db.clone();
        tokio::spawn(async move { insert(&db, "later").await })
    };

    let db = fixture.db.clone();
    assert!(wait_for(Duration::from_secs(5), || db.stats().units > before).await);
    assert_eq!(fixture.count("items"), 0, "open batch must not be visible");

    pending.await.unwrap().unwrap();
    assert_eq!(fixture.count("items"), 1);
}

#[tokio::test]
async fn test_single_write_waits_for_flush_deadline() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(150));
    create_items(&fixture.db).await;

    let start = Instant::now();
    insert(&fixture.db, "x").await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(140), "committed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "committed too late: {elapsed:?}");
}

#[tokio::test]
async fn test_default_flush_keeps_latency_low() {
    let fixture = TestFixture::new();
    create_items(&fixture.db).await;

    let start = Instant::now();
    for i in 0..20 {
        insert(&fixture.db, &format!("n{i}")).await.unwrap();
    }
    // 20 sequential writes, each bounded by the 3ms window plus an fsync.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_max_batch_size_commits_early() {
    let fixture = TestFixture::with_config(|config| {
        config
            .with_flush_interval(Duration::from_secs(30))
            .with_max_batch_size(2)
    });

    let start = Instant::now();
    let (a, b) = tokio::join!(
        fixture.db.write(|tx| tx.execute_batch("CREATE TABLE one (v INTEGER)")),
        fixture.db.write(|tx| tx.execute_batch("CREATE TABLE two (v INTEGER)")),
    );
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(fixture.db.stats().commits, 1);
}

#[tokio::test]
async fn test_begin_failure_only_fails_that_unit() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Db::open(StoreConfig {
        pragmas: Pragmas {
            busy_timeout: Duration::from_millis(20),
            ..Pragmas::default()
        },
        ..StoreConfig::new(&db_path)
    })
    .unwrap();
    create_items(&db).await;

    // Another connection takes the write lock.
    let intruder = rusqlite::Connection::open(&db_path).unwrap();
    intruder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let err = insert(&db, "blocked").await.unwrap_err();
    assert!(matches!(err, Error::Begin(_)), "unexpected error: {err:?}");
    assert_eq!(db.stats().begin_failures, 1);

    intruder.execute_batch("ROLLBACK").unwrap();
    insert(&db, "allowed").await.unwrap();
    let count: i64 = db
        .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_failure_reaches_every_unit() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(200));
    fixture
        .db
        .write(|tx| {
            tx.execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (
                     id INTEGER PRIMARY KEY,
                     parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
                 );",
            )
        })
        .await
        .unwrap();

    let db = &fixture.db;
    let (good, orphan) = tokio::join!(
        db.write(|tx| tx.execute("INSERT INTO parent (id) VALUES (1)", []).map(|_| ())),
        // Deferred foreign keys are only checked at COMMIT.
        db.write(|tx| tx.execute("INSERT INTO child (parent_id) VALUES (99)", []).map(|_| ())),
    );

    let good = good.unwrap_err();
    let orphan = orphan.unwrap_err();
    assert!(matches!(good, Error::Commit(_)), "good: {good:?}");
    assert!(matches!(orphan, Error::Commit(_)), "orphan: {orphan:?}");
    assert!(good.is_batch_failure());
    assert_eq!(fixture.count("parent"), 0);
    assert_eq!(fixture.count("child"), 0);

    // The writer recovered.
    db.write(|tx| tx.execute("INSERT INTO parent (id) VALUES (2)", []).map(|_| ()))
        .await
        .unwrap();
    assert_eq!(fixture.count("parent"), 1);
}

#[tokio::test]
async fn test_read_path_refuses_writes() {
    let fixture = TestFixture::new();
    create_items(&fixture.db).await;

    let result = fixture
        .db
        .execute("INSERT INTO items (name) VALUES ('sneaky')", []);
    assert!(matches!(result, Err(Error::Sqlite(_))));
    assert_eq!(fixture.count("items"), 0);
}

#[tokio::test]
async fn test_close_drains_pending_batch() {
    let fixture = TestFixture::with_flush_interval(Duration::from_secs(30));

    let pending = {
        let db = fixture.db.clone();
        tokio::spawn(async move {
            db.write(|tx| {
                tx.execute_batch("CREATE TABLE items (name TEXT)")?;
                tx.execute("INSERT INTO items (name) VALUES ('kept')", [])?;
                Ok(())
            })
            .await
        })
    };

    let db = fixture.db.clone();
    assert!(wait_for(Duration::from_secs(5), || db.stats().units == 1).await);

    let start = Instant::now();
    fixture.db.close().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(10), "close waited for the flush timer");
    pending.await.unwrap().unwrap();

    let reopened = Db::open(StoreConfig::new(&fixture.db_path)).unwrap();
    let count: i64 = reopened
        .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_calls_after_close_are_refused() {
    let fixture = TestFixture::new();
    create_items(&fixture.db).await;
    let clone = fixture.db.clone();

    fixture.db.close().await.unwrap();
    // Closing again, from any clone, is a no-op.
    fixture.db.close().await.unwrap();
    clone.close().await.unwrap();

    assert!(matches!(insert(&clone, "late").await, Err(Error::Closed)));
    assert!(matches!(
        clone.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)),
        Err(Error::Closed)
    ));
    assert!(matches!(clone.execute("SELECT 1", []), Err(Error::Closed)));
}

#[test]
fn test_blocking_write_from_threads() {
    let fixture = TestFixture::new();
    fixture
        .db
        .blocking_write(|tx| tx.execute_batch("CREATE TABLE hits (thread INTEGER, n INTEGER)"))
        .unwrap();

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let db = fixture.db.clone();
            std::thread::spawn(move || {
                for n in 0..25 {
                    db.blocking_write(move |tx| {
                        tx.execute("INSERT INTO hits (thread, n) VALUES (?1, ?2)", params![t, n])?;
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(fixture.count("hits"), 200);
    tokio_test::block_on(fixture.db.close()).unwrap();
}

#[tokio::test]
async fn test_panicking_unit_aborts_batch_and_writer_survives() {
    let fixture = TestFixture::with_flush_interval(Duration::from_millis(200));
    create_items(&fixture.db).await;
    let db = &fixture.db;

    let (sibling, panicker) = tokio::join!(
        insert(db, "a"),
        db.write(|_| -> greener::Result<()> { panic!("unit blew up") }),
    );
    assert!(matches!(sibling, Err(Error::BatchAborted)), "sibling: {sibling:?}");
    assert!(
        matches!(panicker, Err(Error::UnitPanicked(ref msg)) if msg.contains("unit blew up")),
        "panicker: {panicker:?}"
    );
    assert_eq!(fixture.count("items"), 0);

    // The writer is still serving units.
    insert(db, "b").await.unwrap();
    assert_eq!(fixture.count("items"), 1);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_recording_two_errors_stops_writer() {
    let fixture = TestFixture::new();

    let result = fixture
        .db
        .write(|tx| {
            let _ = tx.abort(Error::rejected("first"));
            Err(tx.abort(Error::rejected("second")))
        })
        .await;
    assert!(matches!(result, Err(Error::Closed)), "got {result:?}");

    assert!(matches!(insert(&fixture.db, "x").await, Err(Error::Closed)));
    assert!(matches!(fixture.db.close().await, Err(Error::WriterPanic)));
}
