//! Transaction execution with retry
//!
//! A unit of work is a closure over `&mut PgConnection` that returns a boxed
//! future. The manager runs it inside `BEGIN`/`COMMIT`, rolls back on any
//! failure, and re-runs it from scratch when the failure classifies as
//! transient. The closure must therefore be `Fn`: every attempt starts clean.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection};

use crate::db::pool::ConnectionPool;
use crate::db::retry::{condition_name, sqlstate, Backoff, RetryPolicy};
use crate::error::{Result, StoreError};
use crate::models::ValidationError;

static SAVEPOINT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid savepoint regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Per-call transaction settings
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
    /// Bound on a single attempt, also applied as `statement_timeout`
    pub timeout: Duration,
    /// Additional attempts after the first
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        crate::config::TransactionConfig::default().options()
    }
}

impl TransactionOptions {
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.retry_delay,
            multiplier: self.backoff_multiplier,
            max: self.max_delay,
        }
    }

    /// `SET TRANSACTION` statement issued right after `BEGIN`.
    fn set_transaction_sql(&self) -> String {
        let access = if self.read_only { " READ ONLY" } else { "" };
        format!(
            "SET TRANSACTION ISOLATION LEVEL {}{}",
            self.isolation_level.as_sql(),
            access
        )
    }

    fn statement_timeout_sql(&self) -> String {
        format!(
            "SET LOCAL statement_timeout = {}",
            self.timeout.as_millis().max(1)
        )
    }
}

/// Result of `execute_transaction` plus how it got there
#[derive(Debug)]
pub struct TransactionReport<T> {
    pub outcome: Result<T>,
    /// Attempts made after the first
    pub retry_count: u32,
    pub duration: Duration,
    exhausted: bool,
}

impl<T> TransactionReport<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// True when the last failure was transient but the retry budget ran out.
    pub fn retries_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Unwrap the outcome, converting infrastructure failures into
    /// `StoreError::Processing` with the operation's context.
    pub fn into_result(self, operation: &'static str, assessment_id: Option<&str>) -> Result<T> {
        let Self {
            outcome,
            retry_count,
            duration,
            exhausted,
        } = self;
        outcome.map_err(|e| {
            e.into_processing(operation, assessment_id, retry_count, duration, exhausted)
        })
    }
}

/// Unit of work signature shared by every transaction entry point
pub type Work<T> =
    Box<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync>;

/// Named step of a batch transaction
pub struct BatchOperation<T> {
    pub name: String,
    pub work: Work<T>,
}

impl<T> BatchOperation<T> {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            work: Box::new(work),
        }
    }
}

impl<T> fmt::Debug for BatchOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Runs units of work in transactions on a shared pool
#[derive(Clone)]
pub struct TransactionManager {
    pool: Arc<ConnectionPool>,
    policy: Arc<RetryPolicy>,
    defaults: TransactionOptions,
}

impl TransactionManager {
    pub fn new(pool: Arc<ConnectionPool>, policy: RetryPolicy, defaults: TransactionOptions) -> Self {
        Self {
            pool,
            policy: Arc::new(policy),
            defaults,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` in a transaction, retrying transient failures with
    /// exponential backoff. `None` uses the manager's defaults.
    pub async fn execute_transaction<T, F>(
        &self,
        work: F,
        options: Option<TransactionOptions>,
    ) -> TransactionReport<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let backoff = options.backoff();
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let attempt = retries + 1;
            let err = match self.attempt(&work, &options).await {
                Ok(value) => {
                    tracing::debug!(
                        attempt,
                        retry_count = retries,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "transaction committed"
                    );
                    return TransactionReport {
                        outcome: Ok(value),
                        retry_count: retries,
                        duration: started.elapsed(),
                        exhausted: false,
                    };
                }
                Err(e) => e,
            };

            self.pool.record_error(&err);
            let retryable = self.policy.classify(&err).is_retryable();
            let code = sqlstate(&err);
            let condition = code.as_deref().and_then(condition_name);

            if !retryable || retries >= options.retry_count {
                if retryable {
                    tracing::error!(
                        attempt,
                        retry_count = retries,
                        duration_ms = started.elapsed().as_millis() as u64,
                        code = code.as_deref().unwrap_or("-"),
                        condition = condition.unwrap_or("-"),
                        error = %err,
                        "transaction failed; retries exhausted"
                    );
                } else if !err.is_domain() {
                    tracing::debug!(
                        attempt,
                        code = code.as_deref().unwrap_or("-"),
                        error = %err,
                        "transaction failed with permanent error"
                    );
                }
                return TransactionReport {
                    outcome: Err(err),
                    retry_count: retries,
                    duration: started.elapsed(),
                    exhausted: retryable,
                };
            }

            retries += 1;
            let delay = backoff.delay(retries);
            tracing::warn!(
                attempt,
                retry_count = retries,
                delay_ms = delay.as_millis() as u64,
                code = code.as_deref().unwrap_or("-"),
                condition = condition.unwrap_or("-"),
                error = %err,
                "retryable transaction failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt: begin, configure, run, then commit or roll back.
    async fn attempt<T, F>(&self, work: &F, options: &TransactionOptions) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        match run_configured(&mut *tx, work, options).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run named operations in a single transaction. Any failure rolls back
    /// the whole batch and the batch is retried as a unit.
    pub async fn execute_batch_transaction<T>(
        &self,
        operations: Vec<BatchOperation<T>>,
        options: Option<TransactionOptions>,
    ) -> TransactionReport<Vec<(String, T)>>
    where
        T: Send + 'static,
    {
        let operations = Arc::new(operations);
        self.execute_transaction(
            move |conn| {
                let operations = Arc::clone(&operations);
                Box::pin(async move {
                    let mut results = Vec::with_capacity(operations.len());
                    for op in operations.iter() {
                        match (op.work)(&mut *conn).await {
                            Ok(value) => results.push((op.name.clone(), value)),
                            Err(e) => {
                                tracing::debug!(operation = %op.name, error = %e, "batch step failed");
                                return Err(e);
                            }
                        }
                    }
                    Ok::<_, StoreError>(results)
                })
            },
            options,
        )
        .await
    }

    pub async fn execute_read_only<T, F>(&self, work: F) -> TransactionReport<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        self.execute_transaction(work, Some(self.defaults.clone().read_only()))
            .await
    }

    pub async fn execute_repeatable_read<T, F>(&self, work: F) -> TransactionReport<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let options = self
            .defaults
            .clone()
            .with_isolation(IsolationLevel::RepeatableRead);
        self.execute_transaction(work, Some(options)).await
    }

    pub async fn execute_serializable<T, F>(&self, work: F) -> TransactionReport<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let options = self
            .defaults
            .clone()
            .with_isolation(IsolationLevel::Serializable);
        self.execute_transaction(work, Some(options)).await
    }
}

async fn run_configured<T, F>(
    conn: &mut PgConnection,
    work: &F,
    options: &TransactionOptions,
) -> Result<T>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
{
    sqlx::query(&options.set_transaction_sql())
        .execute(&mut *conn)
        .await?;
    sqlx::query(&options.statement_timeout_sql())
        .execute(&mut *conn)
        .await?;
    match tokio::time::timeout(options.timeout, work(conn)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            after: options.timeout,
        }),
    }
}

fn savepoint_name(name: &str) -> std::result::Result<&str, ValidationError> {
    if SAVEPOINT_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(ValidationError::InvalidFormat {
            field: "savepoint",
            reason: "must be an identifier of letters, digits and underscores",
        })
    }
}

/// `SAVEPOINT <name>` on an open transaction.
pub async fn create_savepoint(conn: &mut PgConnection, name: &str) -> Result<()> {
    let name = savepoint_name(name)?;
    sqlx::query(&format!("SAVEPOINT {}", name))
        .execute(conn)
        .await?;
    tracing::debug!(savepoint = name, "savepoint created");
    Ok(())
}

pub async fn rollback_to_savepoint(conn: &mut PgConnection, name: &str) -> Result<()> {
    let name = savepoint_name(name)?;
    sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
        .execute(conn)
        .await?;
    tracing::debug!(savepoint = name, "rolled back to savepoint");
    Ok(())
}

pub async fn release_savepoint(conn: &mut PgConnection, name: &str) -> Result<()> {
    let name = savepoint_name(name)?;
    sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn isolation_sql() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");

        let options = TransactionOptions::default();
        assert_eq!(
            options.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        let options = options
            .with_isolation(IsolationLevel::Serializable)
            .read_only();
        assert_eq!(
            options.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
    }

    #[test]
    fn statement_timeout_in_millis() {
        let mut options = TransactionOptions::default();
        assert_eq!(
            options.statement_timeout_sql(),
            "SET LOCAL statement_timeout = 30000"
        );
        options.timeout = Duration::from_micros(10);
        assert_eq!(
            options.statement_timeout_sql(),
            "SET LOCAL statement_timeout = 1"
        );
    }

    #[test]
    fn savepoint_names() {
        for ok in ["sp1", "_nested", "Before_Update_2"] {
            assert!(savepoint_name(ok).is_ok(), "{ok}");
        }
        let too_long = "a".repeat(64);
        for bad in ["", "1sp", "sp-1", "sp; DROP TABLE x", "sp 1", too_long.as_str()] {
            assert!(savepoint_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn isolation_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: IsolationLevel,
        }
        let w: Wrapper = toml::from_str(r#"level = "repeatable_read""#).unwrap();
        assert_eq!(w.level, IsolationLevel::RepeatableRead);
    }

    #[test]
    fn report_conversion() {
        let report: TransactionReport<()> = TransactionReport {
            outcome: Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            retry_count: 3,
            duration: Duration::from_millis(700),
            exhausted: true,
        };
        assert!(!report.is_success());
        assert!(report.retries_exhausted());
        let err = report.into_result("update_assessment", Some("a1")).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RetriesExhausted));
        assert_eq!(err.assessment_id(), Some("a1"));

        let report: TransactionReport<()> = TransactionReport {
            outcome: Err(StoreError::transition("a1", "version mismatch")),
            retry_count: 0,
            duration: Duration::ZERO,
            exhausted: false,
        };
        let err = report.into_result("update_assessment", Some("a1")).unwrap_err();
        assert!(matches!(err, StoreError::StateTransition { .. }));

        let report = TransactionReport {
            outcome: Ok(7),
            retry_count: 1,
            duration: Duration::ZERO,
            exhausted: false,
        };
        assert_eq!(report.into_result("get_assessment", None).unwrap(), 7);
    }

    #[test]
    fn backoff_from_options() {
        let backoff = TransactionOptions::default().backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }
}
