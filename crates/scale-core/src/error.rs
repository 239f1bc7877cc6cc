//! # Error Types
//!
//! Validation errors for scale-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  scale-core errors (this file)                                         │
//! │  ├── CoreError        - Domain rule failures                           │
//! │  └── ValidationError  - Caller data violates a field rule              │
//! │                                                                         │
//! │  scale-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  scale-sync errors (separate crate)                                    │
//! │  ├── LinkError        - Device link failures                           │
//! │  └── SyncError        - What the HTTP layer sees                       │
//! │                                                                         │
//! │  Flow: ValidationError → SyncError::Validation → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant names the field it rejects so the caller can point the
//! operator at the exact input to fix. Validation errors are never retried.

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::Plu;

/// Core domain errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Input failed a field rule.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Patch targets a PLU that is not in the table and upserts are off.
    ///
    /// ## When This Occurs
    /// - Device is configured to require pre-existing PLUs
    /// - Operator patches a PLU that was never fetched from the scale
    #[error("Product not found: PLU {plu}")]
    ProductNotFound { plu: Plu },

    /// Sell-by date would fall outside the calendar chrono can represent.
    #[error("Date out of range: {date} + {days} days")]
    DateOverflow { date: NaiveDate, days: u32 },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format or wrong JSON type.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Field may not be changed by a patch.
    #[error("{field} cannot be changed")]
    Immutable { field: String },

    /// Duplicate value (e.g., the same PLU twice in one table).
    #[error("{field} '{value}' is duplicated")]
    Duplicate { field: String, value: String },
}

impl ValidationError {
    /// Returns the name of the field that violated a rule.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Required { field }
            | ValidationError::TooLong { field, .. }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::MustBePositive { field }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::Immutable { field }
            | ValidationError::Duplicate { field, .. } => field,
        }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "name".to_string(),
        };
        assert_eq!(err.to_string(), "name is required");

        let err = ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: 100,
        };
        assert_eq!(err.to_string(), "price must be between 0 and 100");
    }

    #[test]
    fn test_core_error_from_validation() {
        let err: CoreError = ValidationError::Required {
            field: "name".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Validation error: name is required");
    }

    #[test]
    fn test_field_accessor() {
        let err = ValidationError::Duplicate {
            field: "pluNumber".to_string(),
            value: "100".to_string(),
        };
        assert_eq!(err.field(), "pluNumber");
        assert_eq!(ValidationError::invalid("price", "not a number").field(), "price");
    }
}
