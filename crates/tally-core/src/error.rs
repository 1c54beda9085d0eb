//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Domain errors (payload decode, bad TTL)        │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-store errors (separate crate)                                   │
//! │  └── StoreError       - Persistence failures                           │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - Config, persistence, handler, auth             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An event payload could not be decoded into the requested type.
    ///
    /// ## When This Occurs
    /// - A typed subscriber expects `BalanceChanged` but the emitter sent
    ///   something else under the same event type
    #[error("Payload for '{event_type}' could not be decoded: {message}")]
    PayloadDecode { event_type: String, message: String },

    /// A payload could not be encoded to JSON.
    #[error("Payload could not be encoded: {0}")]
    PayloadEncode(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value is reserved for internal use.
    #[error("{field} '{value}' is reserved")]
    Reserved { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "kind".to_string(),
        };
        assert_eq!(err.to_string(), "kind is required");

        let err = ValidationError::MustBePositive {
            field: "ttl".to_string(),
        };
        assert_eq!(err.to_string(), "ttl must be positive");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let core_err: CoreError = ValidationError::Required {
            field: "event_type".to_string(),
        }
        .into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
