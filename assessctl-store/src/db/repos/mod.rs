//! Repository implementations for database access
//!
//! Repositories follow these patterns:
//! - Row locks (`FOR UPDATE`) before read-modify-write
//! - Upserts via ON CONFLICT (no check-then-insert)
//! - Window-function totals for paginated lists (no second COUNT query)

pub mod assessments;

pub use assessments::AssessmentStateStore;
