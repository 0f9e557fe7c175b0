//! Integration tests for deadline-bound transactions.
//!
//! These tests require a PostgreSQL database.
//! Set TEST_POSTGRES_URL environment variable to run them.

use pglink::{Context, Db, DbError};
use sqlx::Row;
use std::time::Duration;

async fn setup() -> Option<(Db, String)> {
    let url = match std::env::var("TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_POSTGRES_URL not set");
            return None;
        }
    };

    let db = Db::connect(&url).await.expect("Failed to connect");
    let table = format!("pglink_ctx_{}", rand::random::<u32>());
    db.execute(sqlx::query(&format!("CREATE TABLE {table} (id BIGINT PRIMARY KEY)")))
        .await
        .expect("Failed to create test table");

    Some((db, table))
}

async fn teardown(db: &Db, table: &str) {
    db.execute(sqlx::query(&format!("DROP TABLE IF EXISTS {table}")))
        .await
        .expect("Failed to drop test table");
    db.shutdown().await;
}

async fn count(db: &Db, table: &str) -> i64 {
    db.query_row(sqlx::query(&format!("SELECT count(*) AS n FROM {table}")))
        .await
        .expect("Failed to count rows")
        .get("n")
}

#[tokio::test]
async fn test_commit_within_deadline() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let mut tx = db.begin_with_timeout(None).await.unwrap();
    assert!(tx.context().deadline().is_some());

    tx.execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (1)")))
        .await
        .unwrap();
    let row = tx
        .query_row(sqlx::query(&format!("SELECT count(*) AS n FROM {table}")))
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 1);

    tx.commit().await.unwrap();
    tx.close().await.unwrap();
    assert!(tx.context().is_cancelled());

    assert_eq!(count(&db, &table).await, 1);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_close_rolls_back_and_releases_context() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let mut tx = db.begin_with_timeout(None).await.unwrap();
    tx.execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (2)")))
        .await
        .unwrap();
    let ctx = tx.context().clone();
    assert!(!ctx.is_done());

    tx.close().await.unwrap();
    assert!(ctx.is_cancelled());
    assert!(tx.is_closed());
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_expired_context_fails_calls_but_close_succeeds() {
    let Some((db, table)) = setup().await else {
        return;
    };

    db.set_timeout(Duration::from_millis(100));

    let mut tx = db.begin_with_timeout(None).await.unwrap();
    tx.execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (3)")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = tx
        .execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (4)")))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DeadlineExceeded), "unexpected error: {err}");

    let err = tx.commit().await.unwrap_err();
    assert!(err.is_timeout());

    tx.close().await.unwrap();
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_caller_deadline_is_reused() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let (parent, parent_cancel) =
        Context::with_timeout(&Context::background(), Duration::from_secs(30));

    let mut tx = db.begin_with_timeout(Some(&parent)).await.unwrap();
    assert_eq!(tx.context().deadline(), parent.deadline());

    tx.rollback().await.unwrap();
    tx.close().await.unwrap();

    // Closing a transaction that reused the caller's deadline leaves the caller's context alone.
    assert!(!parent.is_done());
    parent_cancel.cancel();
    assert!(parent.is_cancelled());

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_cancelled_parent_fails_calls() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let (parent, parent_cancel) = Context::with_cancel(&Context::background());
    let mut tx = db.begin_with_timeout(Some(&parent)).await.unwrap();

    parent_cancel.cancel();
    let err = tx
        .execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (5)")))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled), "unexpected error: {err}");

    tx.close().await.unwrap();
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_nested_contextual_savepoint() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let mut outer = db.begin().await.unwrap();
    {
        let mut inner = outer.begin_with_timeout(None).await.unwrap();
        inner
            .execute(sqlx::query(&format!("INSERT INTO {table} (id) VALUES (6)")))
            .await
            .unwrap();
        let lock = inner.try_lock(rand::random::<i64>()).await.unwrap();
        assert!(!lock.is_session());
        inner.commit().await.unwrap();
        inner.close().await.unwrap();
    }
    outer.commit().await.unwrap();

    assert_eq!(count(&db, &table).await, 1);

    teardown(&db, &table).await;
}
