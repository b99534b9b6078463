//! Assessment lifecycle states and the transition rules between them.
//!
//! ```text
//! PENDING --start--> PROCESSING
//! PROCESSING --succeed--> COMPLETED [terminal]
//! PROCESSING --fail--> FAILED
//! FAILED --retries remain, rescheduled--> PENDING
//! FAILED --retries exhausted--> FAILED [terminal]
//! PENDING|PROCESSING|FAILED --cancel--> CANCELLED [terminal]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Lifecycle state of a tracked assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AssessmentState {
    pub const ALL: [AssessmentState; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Column value stored in `assessment_states.state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a row in this state accepts no further transitions.
    ///
    /// FAILED is terminal only once its retry budget is spent.
    pub fn is_terminal(&self, retry_count: i32, max_retries: i32) -> bool {
        match self {
            Self::Completed | Self::Cancelled => true,
            Self::Failed => retry_count >= max_retries,
            Self::Pending | Self::Processing => false,
        }
    }
}

impl fmt::Display for AssessmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssessmentState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(ValidationError::InvalidVariant {
                field: "state",
                value: s.to_owned(),
            }),
        }
    }
}

/// A named edge of the lifecycle graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Start,
    Succeed,
    Fail,
    Reschedule,
    Cancel,
}

impl Transition {
    /// Default `change_action` recorded in the audit trail.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "complete",
            Self::Fail => "fail",
            Self::Reschedule => "reschedule",
            Self::Cancel => "cancel",
        }
    }

    /// Whether `retry_count` may grow on this edge.
    pub fn is_retry_cycle(&self) -> bool {
        matches!(self, Self::Fail | Self::Reschedule)
    }
}

/// Why a requested state change was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: AssessmentState,
        to: AssessmentState,
    },

    #[error("assessment is terminal in state {state}")]
    Terminal { state: AssessmentState },

    #[error("retries exhausted ({retry_count}/{max_retries}), cannot reschedule")]
    RetriesExhausted { retry_count: i32, max_retries: i32 },

    #[error("retry_count cannot decrease ({from} -> {to})")]
    RetryCountDecrease { from: i32, to: i32 },

    #[error("retry_count may only grow on a fail or reschedule transition")]
    RetryCountOutsideRetryCycle,
}

/// Retry bookkeeping before and after a proposed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub current: i32,
    pub proposed: i32,
    pub max_retries: i32,
}

impl RetryBudget {
    pub fn unchanged(current: i32, max_retries: i32) -> Self {
        Self {
            current,
            proposed: current,
            max_retries,
        }
    }
}

/// Validate a proposed state change.
///
/// Returns `Ok(None)` when the state does not change (a field-only update on
/// a non-terminal row), `Ok(Some(edge))` for a legal transition.
pub fn check_transition(
    from: AssessmentState,
    to: AssessmentState,
    budget: RetryBudget,
) -> Result<Option<Transition>, TransitionError> {
    use AssessmentState::*;

    if budget.proposed < budget.current {
        return Err(TransitionError::RetryCountDecrease {
            from: budget.current,
            to: budget.proposed,
        });
    }

    if from.is_terminal(budget.current, budget.max_retries) {
        return Err(TransitionError::Terminal { state: from });
    }

    let edge = match (from, to) {
        (a, b) if a == b => None,
        (Pending, Processing) => Some(Transition::Start),
        (Processing, Completed) => Some(Transition::Succeed),
        (Processing, Failed) => Some(Transition::Fail),
        (Failed, Pending) => {
            if budget.current >= budget.max_retries {
                return Err(TransitionError::RetriesExhausted {
                    retry_count: budget.current,
                    max_retries: budget.max_retries,
                });
            }
            Some(Transition::Reschedule)
        }
        (Pending | Processing | Failed, Cancelled) => Some(Transition::Cancel),
        _ => return Err(TransitionError::Illegal { from, to }),
    };

    if budget.proposed > budget.current && !edge.is_some_and(|e| e.is_retry_cycle()) {
        return Err(TransitionError::RetryCountOutsideRetryCycle);
    }

    Ok(edge)
}

/// Whether a row with this state and retry count must carry `completed_at`.
pub fn requires_completed_at(state: AssessmentState, retry_count: i32, max_retries: i32) -> bool {
    state.is_terminal(retry_count, max_retries)
}
