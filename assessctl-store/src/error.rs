//! Error types for assessctl-store
//!
//! Callers only ever see the first five variants. `Database`, `Json`,
//! `Migrate` and `Timeout` are produced inside a unit of work and converted
//! into `Processing` before they leave the store.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::models::ValidationError;

/// Machine-readable code carried by [`StoreError::Processing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PoolExhausted,
    TransactionFailed,
    RetriesExhausted,
    Timeout,
    SchemaVerificationFailed,
    Serialization,
    InvalidConfig,
    NotReady,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "POOL_EXHAUSTED",
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::SchemaVerificationFailed => "SCHEMA_VERIFICATION_FAILED",
            Self::Serialization => "SERIALIZATION",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::NotReady => "NOT_READY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation referenced an unknown assessment
    #[error("assessment not found: {assessment_id}")]
    NotFound { assessment_id: String },

    /// Version conflict or illegal state change
    #[error("state transition rejected for {assessment_id}: {reason}")]
    StateTransition {
        assessment_id: String,
        reason: String,
    },

    /// Wrapped lower-level failure with context for logging and alerting
    #[error("{operation} failed [{code}]: {message}")]
    Processing {
        code: ErrorCode,
        operation: &'static str,
        assessment_id: Option<String>,
        retry_count: u32,
        duration: Duration,
        message: String,
    },

    /// No connection became available before the acquire timeout
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unit of work timed out after {after:?}")]
    Timeout { after: Duration },
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(assessment_id: impl Into<String>) -> Self {
        Self::NotFound {
            assessment_id: assessment_id.into(),
        }
    }

    pub fn transition(assessment_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::StateTransition {
            assessment_id: assessment_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Processing error without transaction context.
    pub fn processing(
        code: ErrorCode,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Processing {
            code,
            operation,
            assessment_id: None,
            retry_count: 0,
            duration: Duration::ZERO,
            message: message.into(),
        }
    }

    /// Errors that describe the caller's request rather than infrastructure.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::StateTransition { .. } | Self::Validation(_)
        )
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Processing { code, .. } => Some(*code),
            Self::PoolExhausted { .. } => Some(ErrorCode::PoolExhausted),
            Self::Timeout { .. } => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    pub fn assessment_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { assessment_id } | Self::StateTransition { assessment_id, .. } => {
                Some(assessment_id)
            }
            Self::Processing { assessment_id, .. } => assessment_id.as_deref(),
            _ => None,
        }
    }

    /// Convert an infrastructure error into `Processing`, attaching context.
    ///
    /// Domain errors pass through unchanged; an existing `Processing` error
    /// gains the assessment id if it had none.
    pub fn into_processing(
        self,
        operation: &'static str,
        assessment_id: Option<&str>,
        retry_count: u32,
        duration: Duration,
        exhausted: bool,
    ) -> Self {
        if self.is_domain() {
            return self;
        }
        if let Self::Processing {
            code,
            operation: original,
            assessment_id: existing,
            message,
            ..
        } = self
        {
            return Self::Processing {
                code,
                operation: original,
                assessment_id: existing.or_else(|| assessment_id.map(str::to_owned)),
                retry_count,
                duration,
                message,
            };
        }

        let code = match &self {
            _ if exhausted => ErrorCode::RetriesExhausted,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Json(_) => ErrorCode::Serialization,
            Self::Migrate(_) => ErrorCode::SchemaVerificationFailed,
            _ => ErrorCode::TransactionFailed,
        };

        Self::Processing {
            code,
            operation,
            assessment_id: assessment_id.map(str::to_owned),
            retry_count,
            duration,
            message: self.to_string(),
        }
    }
}
