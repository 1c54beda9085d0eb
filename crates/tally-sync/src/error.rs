//! # Sync Error Types
//!
//! Error types for the bus/cache/queue engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Persistence   │  │     Input               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Persistence    │  │  Validation             │ │
//! │  │  ConfigLoad     │  │   Failed        │  │  Core                   │ │
//! │  │  ConfigSave     │  │  CorruptQueue   │  │                         │ │
//! │  └─────────────────┘  │  Storage        │  └─────────────────────────┘ │
//! │                       └─────────────────┘                               │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │      Auth       │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  AuthFailed     │  │  NoRuntime      │                              │
//! │  │                 │  │  InvalidState   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Listener errors and handler failures never show up here: the bus and the
//! queue recover from them and report them as events.

use tally_core::{CoreError, ValidationError};
use tally_store::StoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure surfaced to callers.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Caller input rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Domain error from tally-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// A queue write could not be made durable; the in-memory change was
    /// rolled back.
    #[error("Persisting the sync queue failed after {attempts} attempt(s): {source}")]
    PersistenceFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The persisted queue could not be decoded at startup.
    #[error("Persisted sync queue is corrupt: {0}")]
    CorruptQueue(String),

    /// Any other storage failure (opening the database, reading).
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// The auth backend could not produce a session.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Background work was requested outside a Tokio runtime.
    #[error("No Tokio runtime available to spawn {0}")]
    NoRuntime(&'static str),

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization { key, message } => {
                SyncError::CorruptQueue(format!("{}: {}", key, message))
            }
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried by the caller.
    ///
    /// ## Retryable Errors
    /// - Persistence failures (disk busy, pool exhausted)
    /// - Generic storage failures
    /// - Auth failures (token refresh may succeed later)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::PersistenceFailed { .. } | SyncError::Storage(_) | SyncError::AuthFailed(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let persist = SyncError::PersistenceFailed {
            attempts: 3,
            source: StoreError::Unavailable("disk full".into()),
        };
        assert!(persist.is_retryable());
        assert!(SyncError::Storage("locked".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::CorruptQueue("eof".into()).is_retryable());
    }

    #[test]
    fn test_serialization_store_error_maps_to_corrupt_queue() {
        let err: SyncError = StoreError::serialization("offline_sync_queue", "eof").into();
        assert!(matches!(err, SyncError::CorruptQueue(ref m) if m.contains("offline_sync_queue")));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::PersistenceFailed {
            attempts: 2,
            source: StoreError::Unavailable("read-only".into()),
        };
        assert!(err.to_string().contains("2 attempt"));
        assert!(err.to_string().contains("read-only"));
    }
}
