//! Pool saturation, retries, batches and savepoints against a real database

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assessctl_store::db::{create_savepoint, release_savepoint, rollback_to_savepoint};
use assessctl_store::{
    BatchOperation, ConnectionPool, ErrorCode, IsolationLevel, PoolConfig, RetryPolicy,
    StoreError, TransactionManager, TransactionOptions,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgConnection;

fn small_pool() -> PoolConfig {
    PoolConfig {
        min_connections: 0,
        max_connections: 2,
        acquire_timeout_ms: 5_000,
        ..PoolConfig::default()
    }
}

fn fast_retries() -> TransactionOptions {
    TransactionOptions {
        retry_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..TransactionOptions::default()
    }
}

async fn manager(connect: PgConnectOptions) -> TransactionManager {
    let pool = ConnectionPool::connect_with(&small_pool(), connect).await.unwrap();
    TransactionManager::new(pool, RetryPolicy::default(), fast_retries())
}

async fn sleep_briefly(conn: &mut PgConnection) -> assessctl_store::Result<()> {
    sqlx::query("SELECT pg_sleep(0.3)").execute(conn).await?;
    Ok(())
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn third_caller_waits_for_release(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let pool = ConnectionPool::connect_with(&small_pool(), connect).await.unwrap();

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        pool.with_connection(|conn| Box::pin(sleep_briefly(conn))),
        pool.with_connection(|conn| Box::pin(sleep_briefly(conn))),
        pool.with_connection(|conn| Box::pin(sleep_briefly(conn))),
    );
    let elapsed = started.elapsed();

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    // two run at once, the third only after a release
    assert!(elapsed >= Duration::from_millis(550), "elapsed {elapsed:?}");
    assert!(elapsed < small_pool().acquire_timeout());

    let stats = pool.stats();
    assert!(stats.total <= 2);
    assert_eq!(stats.total_acquired, 3);
    assert_eq!(stats.total_released, 3);
    assert_eq!(stats.waiting, 0);
    pool.close().await;
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn exhausted_pool_reports_pool_exhausted(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let config = PoolConfig {
        min_connections: 0,
        max_connections: 1,
        acquire_timeout_ms: 200,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::connect_with(&config, connect).await.unwrap();

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.err().unwrap();
    assert!(matches!(err, StoreError::PoolExhausted { .. }));
    drop(held);

    assert!(pool.acquire().await.is_ok());
    assert!(pool.stats().total_errored >= 1);
    pool.close().await;
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn transient_failures_are_retried(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect).await;
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let report = tx
        .execute_transaction(
            move |conn| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        // deadlock_detected, raised server-side
                        sqlx::query(
                            "DO $$ BEGIN RAISE EXCEPTION 'simulated' USING ERRCODE = '40P01'; END $$",
                        )
                        .execute(&mut *conn)
                        .await?;
                    }
                    let n: i32 = sqlx::query_scalar("SELECT 42").fetch_one(&mut *conn).await?;
                    Ok::<_, StoreError>(n)
                })
            },
            None,
        )
        .await;

    assert_eq!(report.retry_count, 2);
    assert_eq!(report.into_result("test_work", None).unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn permanent_failures_are_not_retried(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect).await;
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let report = tx
        .execute_transaction(
            move |conn| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sqlx::query("SELECT * FROM no_such_table")
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, StoreError>(())
                })
            },
            None,
        )
        .await;

    assert_eq!(report.retry_count, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let err = report.into_result("test_work", None).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::TransactionFailed));
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn retry_budget_runs_out(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect).await;
    let report = tx
        .execute_transaction(
            |conn| {
                Box::pin(async move {
                    sqlx::query(
                        "DO $$ BEGIN RAISE EXCEPTION 'simulated' USING ERRCODE = '40001'; END $$",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok::<_, StoreError>(())
                })
            },
            Some(fast_retries().with_retry_count(2)),
        )
        .await;

    assert_eq!(report.retry_count, 2);
    assert!(report.retries_exhausted());
    let err = report.into_result("test_work", Some("a1")).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::RetriesExhausted));
    assert_eq!(err.assessment_id(), Some("a1"));
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn read_only_and_isolation_are_applied(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect).await;

    let report = tx
        .execute_serializable(|conn| {
            Box::pin(async move {
                let level: String = sqlx::query_scalar("SHOW transaction_isolation")
                    .fetch_one(&mut *conn)
                    .await?;
                Ok::<_, StoreError>(level)
            })
        })
        .await;
    assert_eq!(report.into_result("test_work", None).unwrap(), "serializable");

    let report = tx
        .execute_read_only(|conn| {
            Box::pin(async move {
                sqlx::query("CREATE TEMP TABLE should_fail (id INT)")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, StoreError>(())
            })
        })
        .await;
    assert_eq!(report.retry_count, 0);
    assert!(!report.is_success());

    let report = tx
        .execute_repeatable_read(|conn| {
            Box::pin(async move {
                let level: String = sqlx::query_scalar("SHOW transaction_isolation")
                    .fetch_one(&mut *conn)
                    .await?;
                Ok::<_, StoreError>(level)
            })
        })
        .await;
    assert_eq!(report.into_result("test_work", None).unwrap(), "repeatable read");

    let options = TransactionOptions::default().with_isolation(IsolationLevel::RepeatableRead);
    assert_eq!(options.isolation_level.as_sql(), "REPEATABLE READ");
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn batch_rolls_back_as_a_unit(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect.clone()).await;
    let raw = sqlx::PgPool::connect_with(connect).await.unwrap();
    sqlx::query("CREATE TABLE batch_items (name TEXT PRIMARY KEY)")
        .execute(&raw)
        .await
        .unwrap();

    let insert = |name: &'static str| {
        BatchOperation::new(name, move |conn| {
            Box::pin(async move {
                let result = sqlx::query("INSERT INTO batch_items (name) VALUES ($1)")
                    .bind(name)
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, StoreError>(result.rows_affected())
            })
        })
    };

    let report = tx
        .execute_batch_transaction(vec![insert("first"), insert("second")], None)
        .await;
    let results = report.into_result("batch", None).unwrap();
    assert_eq!(
        results,
        vec![("first".to_string(), 1), ("second".to_string(), 1)]
    );

    // duplicate key in the last step undoes the whole batch
    let report = tx
        .execute_batch_transaction(vec![insert("third"), insert("first")], None)
        .await;
    assert!(!report.is_success());
    assert_eq!(report.retry_count, 0);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_items")
        .fetch_one(&raw)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[sqlx::test(migrator = "assessctl_store::MIGRATOR")]
#[ignore = "requires database"]
async fn savepoints_scope_partial_rollback(_pool: PgPoolOptions, connect: PgConnectOptions) {
    let tx = manager(connect).await;

    let report = tx
        .execute_transaction(
            |conn| {
                Box::pin(async move {
                    sqlx::query("CREATE TEMP TABLE savepoint_rows (n INT)")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("INSERT INTO savepoint_rows VALUES (1)")
                        .execute(&mut *conn)
                        .await?;

                    create_savepoint(conn, "before_second").await?;
                    sqlx::query("INSERT INTO savepoint_rows VALUES (2)")
                        .execute(&mut *conn)
                        .await?;
                    rollback_to_savepoint(conn, "before_second").await?;

                    create_savepoint(conn, "before_third").await?;
                    sqlx::query("INSERT INTO savepoint_rows VALUES (3)")
                        .execute(&mut *conn)
                        .await?;
                    release_savepoint(conn, "before_third").await?;

                    let rows: Vec<i32> = sqlx::query_scalar("SELECT n FROM savepoint_rows ORDER BY n")
                        .fetch_all(&mut *conn)
                        .await?;
                    Ok::<_, StoreError>(rows)
                })
            },
            None,
        )
        .await;
    assert_eq!(report.into_result("savepoints", None).unwrap(), vec![1, 3]);

    let report = tx
        .execute_transaction(
            |conn| Box::pin(async move { create_savepoint(conn, "bad name; --").await }),
            None,
        )
        .await;
    assert!(matches!(
        report.into_result("savepoints", None),
        Err(StoreError::Validation(_))
    ));
}
