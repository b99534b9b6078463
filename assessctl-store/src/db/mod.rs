//! Database layer - pool, transactions and the assessment repository
//!
//! # Design Principles
//!
//! - One explicitly constructed pool, shared by `Arc`; no global connection
//! - Every write is guarded by the row's version column
//! - State change and audit row commit in the same transaction
//! - Transient failures are retried as a whole unit of work

pub mod pool;
pub mod repos;
pub mod retry;
pub mod schema;
pub mod transaction;

pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use repos::AssessmentStateStore;
pub use retry::{Backoff, RetryPolicy, Verdict};
pub use schema::{verify_schema, MIGRATOR};
pub use transaction::{
    create_savepoint, release_savepoint, rollback_to_savepoint, BatchOperation, IsolationLevel,
    TransactionManager, TransactionOptions, TransactionReport,
};
