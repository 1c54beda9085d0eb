//! # Domain Types
//!
//! Queue items, connectivity state and the status DTOs returned to the UI.
//!
//! ## Queue Item Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SyncQueueItem States                               │
//! │                                                                         │
//! │              enqueue()                                                  │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │        ┌─────────────────┐   handler failure, retry_count < max        │
//! │        │     Pending     │ ◄─────────────────────────────────┐         │
//! │        │  retry_count=n  │ ──────────────────────────────────┘         │
//! │        └────────┬────────┘                                              │
//! │                 │                                                       │
//! │       ┌─────────┴──────────┐                                           │
//! │       │ success            │ failure, retry_count reaches max           │
//! │       ▼                    ▼                                            │
//! │  ┌──────────┐        ┌──────────┐                                      │
//! │  │  Synced  │        │ Dropped  │   (both terminal, item removed)      │
//! │  └──────────┘        └──────────┘                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

// =============================================================================
// Operation
// =============================================================================

/// A mutation to apply against a remote system.
///
/// `kind` selects the handler (e.g. `"transaction.create"`,
/// `"category.update"`); `data` is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Operation {
    pub kind: String,

    #[ts(type = "unknown")]
    pub data: Value,
}

impl Operation {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Operation {
            kind: kind.into(),
            data,
        }
    }
}

// =============================================================================
// Sync Queue Item
// =============================================================================

/// One pending operation in the offline queue.
///
/// Serialized with camelCase keys; `enqueuedAt` is an ISO-8601 string. The
/// persisted queue is a JSON array of these objects in FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Unique identifier (UUID v4).
    pub id: String,

    pub operation: Operation,

    #[ts(as = "String")]
    pub enqueued_at: DateTime<Utc>,

    /// Number of failed attempts so far.
    pub retry_count: u32,

    /// Attempts allowed before the item is dropped.
    pub max_retries: u32,
}

impl SyncQueueItem {
    /// Creates a pending item with a fresh id and `retry_count = 0`.
    pub fn new(operation: Operation, max_retries: u32) -> Self {
        SyncQueueItem {
            id: Uuid::new_v4().to_string(),
            operation,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }

    pub fn kind(&self) -> &str {
        &self.operation.kind
    }

    /// Records a failed attempt.
    ///
    /// Returns `true` when the retry budget is now exhausted and the item must
    /// be dropped.
    pub fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Summary shown in the sync status.
    pub fn summary(&self) -> PendingItem {
        PendingItem {
            kind: self.operation.kind.clone(),
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
        }
    }
}

/// Terminal or intermediate result of one attempt on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Handler succeeded; item removed.
    Synced,
    /// Handler failed; item kept with an incremented retry count.
    Retried,
    /// Retry budget exhausted; item removed and reported.
    Dropped,
}

impl std::fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemOutcome::Synced => write!(f, "synced"),
            ItemOutcome::Retried => write!(f, "retried"),
            ItemOutcome::Dropped => write!(f, "dropped"),
        }
    }
}

// =============================================================================
// Connectivity
// =============================================================================

/// Process-wide reachability state. Written only by the connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,

    #[ts(as = "String")]
    pub changed_at: DateTime<Utc>,
}

impl ConnectivityState {
    pub fn new(is_online: bool) -> Self {
        ConnectivityState {
            is_online,
            changed_at: Utc::now(),
        }
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        ConnectivityState::new(false)
    }
}

// =============================================================================
// Status DTOs
// =============================================================================

/// A pending item as reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    pub kind: String,

    #[ts(as = "String")]
    pub enqueued_at: DateTime<Utc>,

    pub retry_count: u32,
}

/// Snapshot returned by `sync_status()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub queue_length: usize,
    pub pending_items: Vec<PendingItem>,
    pub is_draining: bool,

    #[ts(as = "Option<String>")]
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Counts reported at the end of a drain (`sync.complete`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
}

impl DrainReport {
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Synced => self.succeeded += 1,
            ItemOutcome::Retried => self.retried += 1,
            ItemOutcome::Dropped => self.dropped += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.retried + self.dropped
    }
}
