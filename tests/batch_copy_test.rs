//! Integration tests for batched statements and bulk COPY.
//!
//! These tests require a PostgreSQL database.
//! Set TEST_POSTGRES_URL environment variable to run them.

use pglink::{Batch, Conn, Db, DbError, Identifier};
use sqlx::Row;
use std::cell::Cell;

async fn setup() -> Option<(Db, String)> {
    let url = match std::env::var("TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_POSTGRES_URL not set");
            return None;
        }
    };

    let db = Db::connect(&url).await.expect("Failed to connect");
    let table = format!("pglink_bulk_{}", rand::random::<u32>());
    db.execute(sqlx::query(&format!(
        "CREATE TABLE {table} (id BIGINT PRIMARY KEY, name TEXT)"
    )))
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
async fn test_batch_results_in_queue_order() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let insert = format!("INSERT INTO {table} (id, name) VALUES ($1, $2)");
    let select = format!("SELECT id FROM {table} ORDER BY id");
    let mut batch = Batch::new();
    batch
        .execute(sqlx::query(&insert).bind(1_i64).bind("one"))
        .execute(sqlx::query(&insert).bind(2_i64).bind("two"))
        .fetch(sqlx::query(&select));

    let results = db.send_batch(batch).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].rows_affected(), 1);
    assert_eq!(results[1].rows_affected(), 1);

    let ids: Vec<i64> = results[2].rows().iter().map(|row| row.get("id")).collect();
    assert_eq!(ids, vec![1, 2]);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_batch_on_pool_is_atomic() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let insert = format!("INSERT INTO {table} (id) VALUES ($1)");
    let mut batch = Batch::new();
    batch
        .execute(sqlx::query(&insert).bind(7_i64))
        .execute(sqlx::query(&insert).bind(7_i64));

    let err = db.send_batch(batch).await.unwrap_err();
    assert_eq!(err.sql_state().as_deref(), Some("23505"));
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_batch_joins_transaction() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let insert = format!("INSERT INTO {table} (id) VALUES ($1)");
    let mut conn = Conn::from(db.begin().await.unwrap());

    let mut batch = Batch::new();
    batch
        .execute(sqlx::query(&insert).bind(1_i64))
        .execute(sqlx::query(&insert).bind(2_i64));
    let results = conn.send_batch(batch).await.unwrap();
    assert_eq!(results.len(), 2);

    conn.rollback().await.unwrap();
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_copy_from_pool() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let rows = vec![
        vec![Some("1".to_string()), Some("plain".to_string())],
        vec![Some("2".to_string()), None],
        vec![Some("3".to_string()), Some("tab\there\nand \\ backslash".to_string())],
    ];
    let copied = db
        .copy_from(&Identifier::from(table.as_str()), &["id", "name"], rows)
        .await
        .unwrap();
    assert_eq!(copied, 3);

    let rows = db
        .query(sqlx::query(&format!("SELECT id, name FROM {table} ORDER BY id")))
        .await
        .unwrap();
    let names: Vec<Option<String>> = rows.iter().map(|row| row.get("name")).collect();
    assert_eq!(
        names,
        vec![
            Some("plain".to_string()),
            None,
            Some("tab\there\nand \\ backslash".to_string()),
        ]
    );

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_copy_from_schema_qualified_in_transaction() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let target = Identifier::from(["public", table.as_str()]);
    let mut tx = db.begin().await.unwrap();
    let copied = tx
        .copy_from(&target, &["id"], (1..=100).map(|id| vec![Some(id.to_string())]))
        .await
        .unwrap();
    assert_eq!(copied, 100);

    let row = tx
        .query_row(sqlx::query(&format!("SELECT count(*) AS n FROM {table}")))
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 100);

    tx.rollback().await.unwrap();
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_copy_aborts_on_ragged_row() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let rows = vec![vec![Some("1"), Some("a")], vec![Some("2")]];
    let err = db
        .copy_from(&Identifier::from(table.as_str()), &["id", "name"], rows)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }), "unexpected error: {err}");
    assert_eq!(count(&db, &table).await, 0);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_copy_aborts_on_ragged_row_after_flushed_chunks() {
    let Some((db, table)) = setup().await else {
        return;
    };

    // Enough valid rows to send several chunks before the bad one.
    let good = (1..=20_000_i64).map(|id| vec![Some(id.to_string()), Some("x".repeat(16))]);
    let bad = std::iter::once(vec![Some("20001".to_string())]);
    let err = db
        .copy_from(&Identifier::from(table.as_str()), &["id", "name"], good.chain(bad))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("row 20000 has 1 values, expected 2"));
    assert_eq!(count(&db, &table).await, 0);

    // The connection that carried the aborted COPY is usable again.
    let copied = db
        .copy_from(
            &Identifier::from(table.as_str()),
            &["id"],
            vec![vec![Some("1")]],
        )
        .await
        .unwrap();
    assert_eq!(copied, 1);

    teardown(&db, &table).await;
}

#[tokio::test]
async fn test_copy_into_missing_table_does_not_drain_rows() {
    let Some((db, table)) = setup().await else {
        return;
    };

    let pulled = Cell::new(0_usize);
    let rows = (0..2_000_000_u64).map(|id| {
        pulled.set(pulled.get() + 1);
        vec![Some(id.to_string())]
    });
    let missing = format!("{table}_missing");
    let err = db
        .copy_from(&Identifier::from(missing.as_str()), &["id"], rows)
        .await
        .unwrap_err();
    assert_eq!(err.sql_state().as_deref(), Some("42P01"), "unexpected error: {err}");
    assert_eq!(pulled.get(), 0);

    teardown(&db, &table).await;
}
