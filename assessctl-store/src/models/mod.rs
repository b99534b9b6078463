//! Domain models: lifecycle states, payloads, records and query shapes.

pub mod filter;
pub mod pagination;
pub mod payload;
pub mod record;
pub mod state;
pub mod validation;

pub use filter::{AssessmentFilter, SortDirection, SortField};
pub use pagination::{Paginated, Pagination};
pub use payload::Payload;
pub use record::{
    AssessmentStateRecord, AssessmentStatistics, AssessmentUpdate, AuditEntry, AuditFields,
    NewAssessment, RetryCandidate, StateCounts,
};
pub use state::{check_transition, AssessmentState, RetryBudget, Transition, TransitionError};
pub use validation::ValidationError;
