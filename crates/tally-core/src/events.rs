//! # Events
//!
//! The event envelope dispatched by the bus, the reserved event names the core
//! emits on its own, and the payload shapes attached to them.
//!
//! ## Reserved Event Names
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Event                    Emitted by             Payload               │
//! │  ───────────────────────  ─────────────────────  ──────────────────── │
//! │  *                        (wildcard, never sent) -                     │
//! │  bus.listener_error       EventBus               ListenerErrorPayload  │
//! │  component.mount          ComponentRegistry      ComponentPayload      │
//! │  component.unmount        ComponentRegistry      ComponentPayload      │
//! │  connectivity.restored    ConnectivityMonitor    ConnectivityState     │
//! │  connectivity.lost        ConnectivityMonitor    ConnectivityState     │
//! │  sync.enqueued            SyncQueue              EnqueuedPayload       │
//! │  sync.start               SyncQueue              DrainStartPayload     │
//! │  sync.item_complete       SyncQueue              ItemCompletePayload   │
//! │  sync.item_retry          SyncQueue              ItemRetryPayload      │
//! │  sync.item_dropped        SyncQueue              ItemDroppedPayload    │
//! │  sync.no_handler          SyncQueue              NoHandlerPayload      │
//! │  sync.complete            SyncQueue              DrainReport           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::Operation;

// =============================================================================
// Event Names
// =============================================================================

/// Wildcard event type: listeners on it observe every emission.
pub const WILDCARD: &str = "*";

/// A listener failed while handling an emission.
pub const LISTENER_ERROR: &str = "bus.listener_error";

pub const COMPONENT_MOUNT: &str = "component.mount";
pub const COMPONENT_UNMOUNT: &str = "component.unmount";

pub const CONNECTIVITY_RESTORED: &str = "connectivity.restored";
pub const CONNECTIVITY_LOST: &str = "connectivity.lost";

pub const SYNC_ENQUEUED: &str = "sync.enqueued";
pub const SYNC_START: &str = "sync.start";
pub const SYNC_ITEM_COMPLETE: &str = "sync.item_complete";
pub const SYNC_ITEM_RETRY: &str = "sync.item_retry";
pub const SYNC_ITEM_DROPPED: &str = "sync.item_dropped";
pub const SYNC_NO_HANDLER: &str = "sync.no_handler";
pub const SYNC_COMPLETE: &str = "sync.complete";

// =============================================================================
// Event Envelope
// =============================================================================

/// A single emission on the bus.
///
/// Events are transient and never persisted. Listeners receive a borrowed
/// `Event`; the payload is shared by every listener of the same emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Opaque namespace string, e.g. `"transaction.added"`.
    #[serde(rename = "type")]
    pub event_type: String,

    #[ts(type = "unknown")]
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Event {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Builds an event from any serializable payload.
    pub fn from_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> CoreResult<Self> {
        let payload =
            serde_json::to_value(payload).map_err(|e| CoreError::PayloadEncode(e.to_string()))?;
        Ok(Event::new(event_type, payload))
    }

    /// Decodes the payload into a concrete type.
    ///
    /// ## Example
    /// ```rust
    /// use serde_json::json;
    /// use tally_core::events::{ComponentPayload, Event, COMPONENT_MOUNT};
    ///
    /// let event = Event::new(
    ///     COMPONENT_MOUNT,
    ///     json!({ "componentName": "Home", "instanceId": "a1" }),
    /// );
    /// let payload: ComponentPayload = event.payload_as().unwrap();
    /// assert_eq!(payload.component_name, "Home");
    /// ```
    pub fn payload_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        T::deserialize(&self.payload).map_err(|e| CoreError::PayloadDecode {
            event_type: self.event_type.clone(),
            message: e.to_string(),
        })
    }

    /// Returns true for the events the core reserves for itself.
    pub fn is_reserved(event_type: &str) -> bool {
        event_type == WILDCARD
            || event_type.starts_with("bus.")
            || event_type.starts_with("component.")
            || event_type.starts_with("connectivity.")
            || event_type.starts_with("sync.")
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload of `bus.listener_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ListenerErrorPayload {
    /// Event type whose dispatch failed.
    pub event_type: String,
    pub listener_id: u64,
    pub owner_component: Option<String>,
    pub message: String,
    /// True when the listener panicked rather than returning an error.
    pub panicked: bool,
}

/// Payload of `component.mount` / `component.unmount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPayload {
    pub component_name: String,
    pub instance_id: String,
}

/// Payload of `sync.enqueued`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedPayload {
    pub id: String,
    pub kind: String,
    pub queue_length: usize,
}

/// Payload of `sync.start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DrainStartPayload {
    /// Number of items in this drain's snapshot.
    pub queue_length: usize,
}

/// Payload of `sync.item_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ItemCompletePayload {
    pub id: String,
    pub kind: String,
}

/// Payload of `sync.item_retry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ItemRetryPayload {
    pub id: String,
    pub kind: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: String,
}

/// Payload of `sync.item_dropped`.
///
/// Carries the full operation so the UI can offer to re-enqueue it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ItemDroppedPayload {
    pub id: String,
    pub operation: Operation,
    pub retry_count: u32,
    pub error: String,
}

/// Payload of `sync.no_handler`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct NoHandlerPayload {
    pub id: String,
    pub kind: String,
}
