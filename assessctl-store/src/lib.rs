//! Persistence and transaction layer for assessment lifecycle state.
//!
//! - [`db::ConnectionPool`]: bounded PostgreSQL pool with health and pressure stats
//! - [`db::TransactionManager`]: units of work with isolation, timeout and retry
//! - [`AssessmentStateStore`]: state-machine-aware DAO with an audit trail
//!
//! ```no_run
//! use assessctl_store::{AssessmentStateStore, AssessmentUpdate, NewAssessment, Payload, StoreConfig};
//!
//! # async fn demo() -> assessctl_store::Result<()> {
//! let store = AssessmentStateStore::open(StoreConfig::load()?).await?;
//! let request = Payload::from_json_str(1, r#"{"scope":"full"}"#)?;
//! let id = store
//!     .create_assessment(NewAssessment::new("db-01", "baseline", request), None)
//!     .await?;
//! let record = store.get_assessment(&id).await?;
//! store
//!     .update_assessment(&id, AssessmentUpdate::start(), Some(record.version))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{PoolConfig, RetryTableConfig, StoreConfig, TransactionConfig};
pub use db::{
    AssessmentStateStore, BatchOperation, ConnectionPool, IsolationLevel, PoolStats,
    RetryPolicy, TransactionManager, TransactionOptions, TransactionReport, MIGRATOR,
};
pub use error::{ErrorCode, Result, StoreError};
pub use models::{
    AssessmentFilter, AssessmentState, AssessmentStateRecord, AssessmentStatistics,
    AssessmentUpdate, AuditEntry, NewAssessment, Paginated, Pagination, Payload, RetryCandidate,
    SortDirection, SortField, StateCounts, ValidationError,
};
