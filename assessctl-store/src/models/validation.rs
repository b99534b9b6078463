//! Validation error types

use std::fmt;

/// Validation error for caller-supplied values.
///
/// Raised before any statement reaches the database, so a validation
/// failure never consumes retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field is empty when it shouldn't be
    Empty { field: &'static str },

    /// Field exceeds maximum length
    TooLong { field: &'static str, max: usize },

    /// Numeric field outside its allowed range (inclusive bounds)
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },

    /// String doesn't match required format (e.g., savepoint identifiers)
    InvalidFormat { field: &'static str, reason: &'static str },

    /// Invalid enum variant
    InvalidVariant { field: &'static str, value: String },

    /// Payload is not well-formed structured data
    MalformedPayload { field: &'static str, reason: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { field } => write!(f, "{} cannot be empty", field),
            Self::TooLong { field, max } => {
                write!(f, "{} exceeds maximum length of {} characters", field, max)
            }
            Self::OutOfRange {
                field,
                min,
                max,
                value,
            } => write!(f, "{} must be between {} and {}, got {}", field, min, max, value),
            Self::InvalidFormat { field, reason } => {
                write!(f, "{}: {}", field, reason)
            }
            Self::InvalidVariant { field, value } => {
                write!(f, "invalid {} value: '{}'", field, value)
            }
            Self::MalformedPayload { field, reason } => {
                write!(f, "{} is not well-formed JSON: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Reject empty or oversized text fields.
pub(crate) fn non_empty(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}
