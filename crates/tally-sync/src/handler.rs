//! # Sync Handlers
//!
//! Per-kind handlers that push queued operations to the remote side, and the
//! auth seam they receive their session through.
//!
//! ## Dispatch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Handler Dispatch                                 │
//! │                                                                         │
//! │  SyncQueueItem { operation: { kind: "create_post", data } }           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  HandlerRegistry::get("create_post")                                   │
//! │        │                                                                │
//! │        ├── Some(handler) ──► handler.handle(data, HandlerContext)      │
//! │        │                         │                                      │
//! │        │                         ├── Ok(())            → Synced        │
//! │        │                         ├── Err(retryable)    → retry count+1 │
//! │        │                         └── Err(permanent)    → Dropped       │
//! │        │                                                                │
//! │        └── None ──► "sync.no_handler" + counts as a failed attempt     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

use tally_core::validation::validate_operation_kind;

use crate::error::SyncResult;

// =============================================================================
// Handler Errors
// =============================================================================

/// Failure reported by a sync handler.
///
/// `retryable = false` tells the queue that another attempt cannot succeed
/// (bad payload, rejected by the server) and the item is dropped at once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure; the item stays queued until retries run out.
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no retry will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::permanent(format!("invalid operation data: {}", err))
    }
}

pub type HandlerResult = Result<(), HandlerError>;

// =============================================================================
// Auth Seam
// =============================================================================

/// Session handed to handlers so they can authenticate remote calls.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of the current session. Queried once at the start of each drain.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `Ok(None)` means nobody is signed in.
    async fn session(&self) -> SyncResult<Option<AuthSession>>;
}

// =============================================================================
// Handler Trait
// =============================================================================

/// Per-attempt context.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub item_id: String,
    /// 1 on the first attempt.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub session: Option<AuthSession>,
}

/// Pushes one kind of operation to the remote side.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, data: Value, ctx: HandlerContext) -> HandlerResult;
}

/// Adapter that lets a plain async closure act as a handler.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: Value, ctx: HandlerContext) -> HandlerResult {
        (self.0)(data, ctx).await
    }
}

// =============================================================================
// Handler Registry
// =============================================================================

/// Maps operation kinds to handlers. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn OperationHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `kind`.
    pub fn register(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> SyncResult<()> {
        let kind = kind.into();
        validate_operation_kind(&kind)?;

        if self.write().insert(kind.clone(), handler).is_some() {
            debug!(kind = %kind, "Replaced sync handler");
        } else {
            debug!(kind = %kind, "Registered sync handler");
        }
        Ok(())
    }

    /// Registers an async closure as the handler for `kind`.
    pub fn register_fn<F, Fut>(&self, kind: impl Into<String>, handler: F) -> SyncResult<()>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler(handler)))
    }

    /// Returns true if a handler was removed.
    pub fn unregister(&self, kind: &str) -> bool {
        self.write().remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn OperationHandler>> {
        self.read().get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn OperationHandler>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn OperationHandler>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> HandlerContext {
        HandlerContext {
            item_id: "item-1".into(),
            attempt: 1,
            enqueued_at: Utc::now(),
            session: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch_closure() {
        let registry = HandlerRegistry::new();
        registry
            .register_fn("create_post", |data, _ctx| async move {
                if data["title"].is_string() {
                    Ok(())
                } else {
                    Err(HandlerError::permanent("missing title"))
                }
            })
            .unwrap();

        let handler = registry.get("create_post").unwrap();
        assert!(handler.handle(json!({"title": "hi"}), ctx()).await.is_ok());

        let err = handler.handle(json!({}), ctx()).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "missing title");
    }

    #[test]
    fn test_register_rejects_invalid_kind() {
        let registry = HandlerRegistry::new();
        let result = registry.register_fn("", |_data, _ctx| async { Ok(()) });
        assert!(result.is_err());
        assert!(registry.kinds().is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register_fn("b", |_d, _c| async { Ok(()) }).unwrap();
        registry.register_fn("a", |_d, _c| async { Ok(()) }).unwrap();
        assert_eq!(registry.kinds(), vec!["a".to_string(), "b".to_string()]);

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_register_survives_poisoned_table() {
        let registry = HandlerRegistry::new();
        let shared = registry.clone();
        let crashed = std::thread::spawn(move || {
            let _table = shared.handlers.write().unwrap();
            panic!("handler table writer crashed");
        })
        .join();
        assert!(crashed.is_err());
        assert!(registry.handlers.is_poisoned());

        registry.register_fn("like", |_d, _c| async { Ok(()) }).unwrap();
        assert!(registry.get("like").is_some());
        assert_eq!(registry.kinds(), vec!["like".to_string()]);
        assert!(registry.unregister("like"));
    }

    #[test]
    fn test_json_errors_are_permanent() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let handler_err: HandlerError = err.into();
        assert!(!handler_err.retryable);
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = AuthSession {
            user_id: "u1".into(),
            access_token: "secret-token".into(),
            expires_at: None,
        };
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-token"));
        assert!(!session.is_expired());
    }
}
