//! Assessment records, mutation requests and aggregate views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::validation::non_empty;
use super::{AssessmentState, Payload, ValidationError};

/// Maximum length for target and assessment type
const MAX_LABEL_LEN: usize = 512;

/// Maximum length for free-text status and error messages
const MAX_MESSAGE_LEN: usize = 8 * 1024;

/// Maximum length for caller-supplied assessment ids
pub const MAX_ASSESSMENT_ID_LEN: usize = 128;

/// One tracked assessment, as persisted in `assessment_states`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentStateRecord {
    pub assessment_id: String,
    pub state: AssessmentState,
    pub version: i64,
    pub progress: i32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub target: String,
    pub assessment_type: String,
    pub priority: i32,
    pub timeout_seconds: Option<i32>,
    pub request_data: Payload,
    pub result_data: Option<Payload>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl AssessmentStateRecord {
    /// A stamped `completed_at` is terminal whatever budget is passed.
    pub fn is_terminal(&self, max_retries: i32) -> bool {
        self.completed_at.is_some() || self.state.is_terminal(self.retry_count, max_retries)
    }
}

/// Append-only history row, one per accepted transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub assessment_id: String,
    pub old_state: AssessmentState,
    pub new_state: AssessmentState,
    pub version_from: i64,
    pub version_to: i64,
    pub changed_by: String,
    pub change_reason: Option<String>,
    pub change_action: String,
    pub created_at: DateTime<Utc>,
    pub context: Option<Payload>,
}

/// Request to create (or reset) an assessment
#[derive(Debug, Clone)]
pub struct NewAssessment {
    pub target: String,
    pub assessment_type: String,
    pub priority: i32,
    pub timeout_seconds: Option<i32>,
    pub request: Payload,
    /// Recorded as `changed_by` when an existing row is reset
    pub requested_by: Option<String>,
}

impl NewAssessment {
    pub fn new(
        target: impl Into<String>,
        assessment_type: impl Into<String>,
        request: Payload,
    ) -> Self {
        Self {
            target: target.into(),
            assessment_type: assessment_type.into(),
            priority: 0,
            timeout_seconds: None,
            request,
            requested_by: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn requested_by(mut self, who: impl Into<String>) -> Self {
        self.requested_by = Some(who.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        non_empty("target", &self.target, MAX_LABEL_LEN)?;
        non_empty("assessment_type", &self.assessment_type, MAX_LABEL_LEN)?;
        if let Some(seconds) = self.timeout_seconds {
            if seconds <= 0 {
                return Err(ValidationError::OutOfRange {
                    field: "timeout_seconds",
                    min: 1,
                    max: i64::from(i32::MAX),
                    value: i64::from(seconds),
                });
            }
        }
        Ok(())
    }
}

/// Audit metadata attached to a mutation
#[derive(Debug, Clone, Default)]
pub struct AuditFields {
    pub changed_by: Option<String>,
    pub change_reason: Option<String>,
    pub change_action: Option<String>,
    pub context: Option<Payload>,
}

impl AuditFields {
    pub fn is_empty(&self) -> bool {
        self.changed_by.is_none()
            && self.change_reason.is_none()
            && self.change_action.is_none()
            && self.context.is_none()
    }
}

/// Field-level mutation. Only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct AssessmentUpdate {
    pub state: Option<AssessmentState>,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub result_data: Option<Payload>,
    pub error_message: Option<String>,
    pub retry_count: Option<i32>,
    /// `Some(None)` clears the column
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub priority: Option<i32>,
    pub audit: AuditFields,
}

impl AssessmentUpdate {
    /// PENDING -> PROCESSING
    pub fn start() -> Self {
        Self {
            state: Some(AssessmentState::Processing),
            ..Self::default()
        }
    }

    /// Progress-only update
    pub fn progress(progress: i32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// PROCESSING -> COMPLETED
    pub fn complete(result: Option<Payload>) -> Self {
        Self {
            state: Some(AssessmentState::Completed),
            progress: Some(100),
            result_data: result,
            ..Self::default()
        }
    }

    /// PROCESSING -> FAILED, recording the attempt count
    pub fn fail(error: impl Into<String>, retry_count: i32) -> Self {
        Self {
            state: Some(AssessmentState::Failed),
            error_message: Some(error.into()),
            retry_count: Some(retry_count),
            ..Self::default()
        }
    }

    /// FAILED -> PENDING
    pub fn reschedule(next_retry_at: Option<DateTime<Utc>>) -> Self {
        Self {
            state: Some(AssessmentState::Pending),
            progress: Some(0),
            next_retry_at: Some(next_retry_at),
            ..Self::default()
        }
    }

    /// PENDING|PROCESSING|FAILED -> CANCELLED
    pub fn cancel(reason: impl Into<String>) -> Self {
        let mut update = Self {
            state: Some(AssessmentState::Cancelled),
            ..Self::default()
        };
        update.audit.change_reason = Some(reason.into());
        update
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn changed_by(mut self, who: impl Into<String>) -> Self {
        self.audit.changed_by = Some(who.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.audit.change_reason = Some(reason.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.audit.change_action = Some(action.into());
        self
    }

    pub fn context(mut self, context: Payload) -> Self {
        self.audit.context = Some(context);
        self
    }

    /// True when no column would be written.
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.result_data.is_none()
            && self.error_message.is_none()
            && self.retry_count.is_none()
            && self.next_retry_at.is_none()
            && self.priority.is_none()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(progress) = self.progress {
            if !(0..=100).contains(&progress) {
                return Err(ValidationError::OutOfRange {
                    field: "progress",
                    min: 0,
                    max: 100,
                    value: i64::from(progress),
                });
            }
        }
        if let Some(retry_count) = self.retry_count {
            if retry_count < 0 {
                return Err(ValidationError::OutOfRange {
                    field: "retry_count",
                    min: 0,
                    max: i64::from(i32::MAX),
                    value: i64::from(retry_count),
                });
            }
        }
        for (field, text) in [("message", &self.message), ("error_message", &self.error_message)] {
            if let Some(text) = text {
                if text.len() > MAX_MESSAGE_LEN {
                    return Err(ValidationError::TooLong {
                        field,
                        max: MAX_MESSAGE_LEN,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Row in the retry feed polled by a scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryCandidate {
    pub assessment_id: String,
    /// Pass back as `expected_version` when rescheduling
    pub version: i64,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Row counts per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StateCounts {
    pub fn get(&self, state: AssessmentState) -> i64 {
        match state {
            AssessmentState::Pending => self.pending,
            AssessmentState::Processing => self.processing,
            AssessmentState::Completed => self.completed,
            AssessmentState::Failed => self.failed,
            AssessmentState::Cancelled => self.cancelled,
        }
    }

    /// Rows still being worked on (PENDING + PROCESSING).
    pub fn in_flight(&self) -> i64 {
        self.pending + self.processing
    }
}

/// Dashboard aggregates over `assessment_states`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentStatistics {
    pub total: i64,
    pub by_state: StateCounts,
    /// Mean `completed_at - created_at` over rows with `completed_at` set
    pub average_processing_seconds: Option<f64>,
    pub created_last_hour: i64,
}

impl AssessmentStatistics {
    /// Share of finished rows that completed, in 0.0..=1.0.
    pub fn completion_ratio(&self) -> Option<f64> {
        let finished = self.by_state.completed + self.by_state.failed + self.by_state.cancelled;
        if finished == 0 {
            None
        } else {
            Some(self.by_state.completed as f64 / finished as f64)
        }
    }
}
