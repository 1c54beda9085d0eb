//! # tally-core: Pure Types for the Tally Sync Core
//!
//! This crate holds the data model shared by the event bus, the TTL cache and
//! the offline sync queue. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 UI Components (external)                        │   │
//! │  │      emit / subscribe ── get / set / clear ── enqueue           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-sync (engine)                          │   │
//! │  │   EventBus • TtlCache • ComponentRegistry • Connectivity • Queue│   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  events   │  │   types   │  │   error   │  │ validation│  │   │
//! │  │   │  Event    │  │ QueueItem │  │ CoreError │  │   rules   │  │   │
//! │  │   │ payloads  │  │ SyncStatus│  │           │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`events`] - Event envelope, reserved event names and their payloads
//! - [`types`] - Queue items, connectivity state, status DTOs
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation for event types, keys and operations
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::{Operation, SyncQueueItem};
//!
//! let op = Operation::new("transaction.create", json!({ "amount": 1250 }));
//! let mut item = SyncQueueItem::new(op, 2);
//!
//! assert!(!item.record_failure());
//! assert!(item.record_failure()); // second failure exhausts the budget
//! ```

pub mod error;
pub mod events;
pub mod types;
pub mod validation;

pub use error::{CoreError, CoreResult, ValidationError};
pub use events::Event;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default retry budget for a queued operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default cache time-to-live in milliseconds (5 minutes).
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Well-known storage key under which the offline queue is persisted.
pub const QUEUE_STORAGE_KEY: &str = "offline_sync_queue";

/// Maximum length of an event type or operation kind.
pub const MAX_NAME_LEN: usize = 128;
