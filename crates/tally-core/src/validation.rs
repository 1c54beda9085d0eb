//! # Validation Module
//!
//! Cheap checks applied at the public entry points of the sync core. Payload
//! schema validation is NOT done here; that belongs to the domain code that
//! owns each payload.
//!
//! ## Usage
//! ```rust
//! use std::time::Duration;
//! use tally_core::validation::{validate_operation_kind, validate_ttl};
//!
//! validate_operation_kind("transaction.create").unwrap();
//! assert!(validate_ttl(Duration::ZERO).is_err());
//! ```

use std::time::Duration;

use crate::error::ValidationError;
use crate::events::WILDCARD;
use crate::MAX_NAME_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn validate_name(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates an event type used for subscribe/emit.
pub fn validate_event_type(event_type: &str) -> ValidationResult<()> {
    validate_name("event_type", event_type)
}

/// Validates an operation kind. The wildcard is not a valid kind.
pub fn validate_operation_kind(kind: &str) -> ValidationResult<()> {
    validate_name("kind", kind)?;

    if kind == WILDCARD {
        return Err(ValidationError::Reserved {
            field: "kind".to_string(),
            value: kind.to_string(),
        });
    }

    Ok(())
}

/// Validates a cache time-to-live.
pub fn validate_ttl(ttl: Duration) -> ValidationResult<()> {
    if ttl.is_zero() {
        return Err(ValidationError::MustBePositive {
            field: "ttl".to_string(),
        });
    }
    Ok(())
}

/// Validates a component name used for lifecycle tracking.
pub fn validate_component_name(name: &str) -> ValidationResult<()> {
    validate_name("component_name", name)
}
