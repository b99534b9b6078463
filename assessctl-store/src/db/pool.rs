//! Database connection pool management
//!
//! Wraps a sqlx `PgPool` with explicit limits and keeps its own counters so
//! operators can see how the pool behaves under load. The pool is created
//! once at startup and shared by `Arc`. Nothing global.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PoolConfig;
use crate::error::{Result, StoreError};

/// Utilization above which the pool reports itself under pressure
pub const PRESSURE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    errored: AtomicU64,
    waiting: AtomicU64,
    wait_micros: AtomicU64,
}

/// Point-in-time view of pool health
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    /// Configured `max_connections`
    pub max: u32,
    pub total: u32,
    pub idle: u32,
    pub active: u32,
    pub waiting: u64,
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_errored: u64,
    pub average_wait_time_ms: f64,
}

impl PoolStats {
    /// Share of `max_connections` currently checked out.
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            0.0
        } else {
            f64::from(self.active) / f64::from(self.max)
        }
    }

    pub fn is_under_pressure(&self) -> bool {
        self.utilization() > PRESSURE_THRESHOLD
    }
}

/// Bounded pool of PostgreSQL connections
pub struct ConnectionPool {
    pool: PgPool,
    config: PoolConfig,
    counters: Arc<PoolCounters>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Connect using a PostgreSQL connection string.
    pub async fn connect(config: &PoolConfig, database_url: &str) -> Result<Arc<Self>> {
        let options: PgConnectOptions = database_url.parse()?;
        Self::connect_with(config, options).await
    }

    /// Connect with explicit connect options.
    ///
    /// The first connection must be established within `create_timeout`.
    pub async fn connect_with(config: &PoolConfig, options: PgConnectOptions) -> Result<Arc<Self>> {
        let counters = Arc::new(PoolCounters::default());
        let on_connect = Arc::clone(&counters);

        let pool_options = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .idle_timeout(config.idle_timeout())
            .acquire_timeout(config.acquire_timeout())
            .after_connect(move |_conn, _meta| {
                let counters = Arc::clone(&on_connect);
                Box::pin(async move {
                    counters.created.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            });

        let pool = tokio::time::timeout(config.create_timeout(), pool_options.connect_with(options))
            .await
            .map_err(|_| StoreError::Timeout {
                after: config.create_timeout(),
            })??;

        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            "connection pool ready"
        );

        let pool = Arc::new(Self {
            pool,
            config: config.clone(),
            counters,
            reaper: Mutex::new(None),
        });
        pool.spawn_reaper();
        Ok(pool)
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let interval = self.config.reap_interval();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.is_closed() {
                    break;
                }
                let stats = pool.stats();
                tracing::debug!(
                    total = stats.total,
                    idle = stats.idle,
                    active = stats.active,
                    waiting = stats.waiting,
                    "pool stats"
                );
                if stats.is_under_pressure() {
                    tracing::warn!(
                        utilization = stats.utilization(),
                        max = pool.config.max_connections,
                        "connection pool under pressure; consider raising max_connections"
                    );
                }
            }
        });

        if let Ok(mut slot) = self.reaper.lock() {
            *slot = Some(handle);
        }
    }

    /// Check out a connection, waiting at most `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let result = {
            let _waiting = WaitGuard::enter(&self.counters);
            self.pool.acquire().await
        };
        let waited = started.elapsed();

        match result {
            Ok(inner) => {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .wait_micros
                    .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
                Ok(PooledConnection {
                    inner,
                    counters: Arc::clone(&self.counters),
                })
            }
            Err(sqlx::Error::PoolTimedOut) => {
                self.counters.errored.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(waited_ms = waited.as_millis() as u64, "connection pool exhausted");
                Err(StoreError::PoolExhausted { waited })
            }
            Err(e) => {
                self.counters.errored.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "failed to acquire connection");
                Err(StoreError::Database(e))
            }
        }
    }

    /// Run `f` on a checked-out connection. The connection goes back to the
    /// pool on every exit path.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut *conn).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Liveness check: one round trip on a pooled connection.
    pub async fn health(&self) -> bool {
        let round_trip = async {
            let mut conn = self.acquire().await?;
            let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut *conn).await?;
            Ok::<_, StoreError>(one == 1)
        };

        match round_trip.await {
            Ok(healthy) => healthy,
            Err(e) => {
                self.record_error(&e);
                tracing::warn!(error = %e, "database health check failed");
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(total);
        let acquired = self.counters.acquired.load(Ordering::Relaxed);
        let wait_micros = self.counters.wait_micros.load(Ordering::Relaxed);

        PoolStats {
            max: self.config.max_connections,
            total,
            idle,
            active: total - idle,
            waiting: self.counters.waiting.load(Ordering::Relaxed),
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_acquired: acquired,
            total_released: self.counters.released.load(Ordering::Relaxed),
            total_errored: self.counters.errored.load(Ordering::Relaxed),
            average_wait_time_ms: average_wait_ms(wait_micros, acquired),
        }
    }

    /// Advisory only; the pool never resizes itself.
    pub fn is_under_pressure(&self) -> bool {
        self.stats().is_under_pressure()
    }

    /// Count an infrastructure failure seen on a pooled connection.
    /// Acquire timeouts are already counted by `acquire`.
    pub fn record_error(&self, err: &StoreError) {
        if err.is_domain() || matches!(err, StoreError::PoolExhausted { .. }) {
            return;
        }
        self.counters.errored.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(error = %err, "connection-level failure recorded");
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Underlying sqlx pool, for migrations.
    pub(crate) fn raw(&self) -> &PgPool {
        &self.pool
    }

    /// Stop the reaper and close every connection, waiting at most
    /// `destroy_timeout` for checked-out connections to come back.
    pub async fn close(&self) {
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let timeout = self.config.destroy_timeout();
        if tokio::time::timeout(timeout, self.pool.close()).await.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "pool close timed out; connections still checked out"
            );
        } else {
            tracing::info!("connection pool closed");
        }
    }
}

/// Checked-out connection; returned to the pool on drop
pub struct PooledConnection {
    inner: PoolConnection<Postgres>,
    counters: Arc<PoolCounters>,
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.inner
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tracks callers blocked in `acquire`, including ones whose future is dropped
struct WaitGuard<'a>(&'a PoolCounters);

impl<'a> WaitGuard<'a> {
    fn enter(counters: &'a PoolCounters) -> Self {
        counters.waiting.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

fn average_wait_ms(total_micros: u64, acquisitions: u64) -> f64 {
    if acquisitions == 0 {
        0.0
    } else {
        total_micros as f64 / acquisitions as f64 / 1_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u32, idle: u32) -> PoolStats {
        PoolStats {
            max: 10,
            total,
            idle,
            active: total - idle,
            waiting: 0,
            total_created: 0,
            total_acquired: 0,
            total_released: 0,
            total_errored: 0,
            average_wait_time_ms: 0.0,
        }
    }

    #[test]
    fn pressure_threshold() {
        assert!(!stats(10, 2).is_under_pressure()); // exactly 0.8
        assert!(stats(10, 1).is_under_pressure());
        assert!(!stats(0, 0).is_under_pressure());
        // measured against capacity, not current size
        assert!(!stats(4, 0).is_under_pressure());
        assert_eq!(stats(4, 1).utilization(), 0.3);
    }

    #[test]
    fn average_wait() {
        assert_eq!(average_wait_ms(0, 0), 0.0);
        assert_eq!(average_wait_ms(3_000, 3), 1.0);
    }

    #[test]
    fn wait_guard_balances() {
        let counters = PoolCounters::default();
        {
            let _a = WaitGuard::enter(&counters);
            let _b = WaitGuard::enter(&counters);
            assert_eq!(counters.waiting.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counters.waiting.load(Ordering::Relaxed), 0);
    }

    // Integration tests require a real database
    // Run with: DATABASE_URL=postgres://... cargo test -p assessctl-store -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn pool_health_and_counters() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = ConnectionPool::connect(&PoolConfig::default(), &url)
            .await
            .expect("pool creation failed");

        assert!(pool.health().await);

        let stats = pool.stats();
        assert!(stats.total_created >= 1);
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);
        assert_eq!(stats.waiting, 0);

        pool.close().await;
        assert!(pool.is_closed());
    }
}
