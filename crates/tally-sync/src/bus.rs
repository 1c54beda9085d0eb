//! # Event Bus
//!
//! In-process publish/subscribe keyed by event type, with a `"*"` wildcard.
//!
//! ## Dispatch Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      emit("balance.changed", payload)                   │
//! │                                                                         │
//! │  1. Lock table, clone listener list for "balance.changed", unlock      │
//! │  2. Lock table, clone listener list for "*", unlock                    │
//! │  3. For each snapshot entry, in subscription order:                    │
//! │       skip if unsubscribed since the snapshot                          │
//! │       skip if `once` and already claimed                               │
//! │       call under catch_unwind                                          │
//! │       ├── Ok            → next                                         │
//! │       └── Err / panic   → log, emit "bus.listener_error", next         │
//! │                                                                         │
//! │  Listeners run on the emitter's thread with no lock held, so they may  │
//! │  subscribe, unsubscribe and emit re-entrantly.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Subscriptions
//! `subscribe` returns a [`Subscription`] handle. Dropping it does **not**
//! unsubscribe; call [`Subscription::unsubscribe`] (idempotent) or tag the
//! listener with an owner and let the component registry remove it.

use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

use tally_core::events::{ListenerErrorPayload, LISTENER_ERROR, WILDCARD};
use tally_core::{CoreResult, Event};

/// Error a listener may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = Result<(), ListenerError>;

type Callback = dyn Fn(&Event) -> ListenerResult + Send + Sync;

// =============================================================================
// Subscription Options
// =============================================================================

/// Per-subscription flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Remove after the first invocation, whether it succeeded or not.
    pub once: bool,
    /// Component that owns this listener; removed when the component unmounts.
    pub owner: Option<String>,
    /// Remove the listener the first time it fails.
    pub unsubscribe_on_error: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn unsubscribe_on_error(mut self) -> Self {
        self.unsubscribe_on_error = true;
        self
    }
}

// =============================================================================
// Listener Table
// =============================================================================

struct Listener {
    id: u64,
    event_type: String,
    owner: Option<String>,
    once: bool,
    unsubscribe_on_error: bool,
    /// Cleared on unsubscribe, and when a `once` listener is claimed.
    active: AtomicBool,
    callback: Box<Callback>,
}

impl Listener {
    /// Returns false if the listener must not run for this dispatch.
    fn claim(&self) -> bool {
        if self.once {
            self.active.swap(false, Ordering::AcqRel)
        } else {
            self.active.load(Ordering::Acquire)
        }
    }
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<String, Vec<Arc<Listener>>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Listener>>>> {
        // Callbacks never run under this lock, so poisoning can only come
        // from a panic inside our own bookkeeping; the table is still valid.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, event_type: &str, id: u64) -> bool {
        let mut table = self.table();
        let Some(list) = table.get_mut(event_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|listener| listener.id != id);
        let removed = list.len() != before;

        if list.is_empty() {
            table.remove(event_type);
        }
        removed
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Process-wide event bus. Cheap to clone; clones share the listener table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `event_type` (or `"*"` for every event).
    pub fn subscribe<F>(
        &self,
        event_type: impl Into<String>,
        callback: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let listener = Arc::new(Listener {
            id,
            event_type: event_type.clone(),
            owner: options.owner,
            once: options.once,
            unsubscribe_on_error: options.unsubscribe_on_error,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        let handle = Subscription {
            id,
            event_type: event_type.clone(),
            listener: Arc::downgrade(&listener),
            bus: Arc::downgrade(&self.inner),
        };

        self.inner
            .table()
            .entry(event_type)
            .or_default()
            .push(listener);

        handle
    }

    /// Shorthand for `subscribe` with default options.
    pub fn on<F>(&self, event_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.subscribe(event_type, callback, SubscribeOptions::default())
    }

    /// Shorthand for a listener that fires at most once.
    pub fn once<F>(&self, event_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.subscribe(event_type, callback, SubscribeOptions::new().once())
    }

    /// Dispatches an event to its listeners, then to wildcard listeners.
    ///
    /// Never fails and never panics because of a listener.
    pub fn emit(&self, event_type: &str, payload: Value) {
        let event = Event::new(event_type, payload);

        let direct = self.snapshot(event_type);
        let wildcard = if event_type == WILDCARD {
            Vec::new()
        } else {
            self.snapshot(WILDCARD)
        };

        for listener in direct.iter().chain(wildcard.iter()) {
            self.dispatch(listener, &event);
        }
    }

    /// Serializes `payload` and emits it.
    pub fn emit_typed<T: Serialize>(&self, event_type: &str, payload: &T) -> CoreResult<()> {
        let event = Event::from_payload(event_type, payload)?;
        self.emit(event_type, event.payload);
        Ok(())
    }

    /// Removes every listener owned by `owner`. Returns how many were removed.
    pub fn remove_owned_by(&self, owner: &str) -> usize {
        let mut table = self.inner.table();
        let mut removed = 0;

        table.retain(|_, list| {
            list.retain(|listener| {
                let owned = listener.owner.as_deref() == Some(owner);
                if owned {
                    listener.active.store(false, Ordering::Release);
                    removed += 1;
                }
                !owned
            });
            !list.is_empty()
        });

        if removed > 0 {
            debug!(owner = %owner, removed, "Removed owned listeners");
        }
        removed
    }

    /// Number of listeners registered for exactly `event_type`.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner.table().get(event_type).map_or(0, Vec::len)
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.table().values().map(Vec::len).sum()
    }

    /// Removes every listener.
    pub fn clear(&self) {
        let drained: Vec<_> = self.inner.table().drain().collect();
        for listener in drained.iter().flat_map(|(_, list)| list) {
            listener.active.store(false, Ordering::Release);
        }
    }

    // =========================================================================
    // Dispatch Internals
    // =========================================================================

    fn snapshot(&self, event_type: &str) -> Vec<Arc<Listener>> {
        self.inner
            .table()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn dispatch(&self, listener: &Arc<Listener>, event: &Event) {
        if !listener.claim() {
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| (listener.callback)(event)));

        if listener.once {
            self.inner.detach(&listener.event_type, listener.id);
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report_failure(listener, event, err.to_string(), false),
            Err(panic) => self.report_failure(listener, event, panic_message(&*panic), true),
        }
    }

    fn report_failure(&self, listener: &Listener, event: &Event, message: String, panicked: bool) {
        error!(
            event_type = %event.event_type,
            listener_id = listener.id,
            owner = ?listener.owner,
            panicked,
            error = %message,
            "Event listener failed"
        );

        if listener.unsubscribe_on_error {
            listener.active.store(false, Ordering::Release);
            self.inner.detach(&listener.event_type, listener.id);
        }

        // Failures while reporting a failure are only logged.
        if event.event_type == LISTENER_ERROR {
            return;
        }

        let payload = ListenerErrorPayload {
            event_type: event.event_type.clone(),
            listener_id: listener.id,
            owner_component: listener.owner.clone(),
            message,
            panicked,
        };

        if let Err(e) = self.emit_typed(LISTENER_ERROR, &payload) {
            warn!(error = %e, "Could not encode listener error payload");
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {}", s)
    } else {
        "listener panicked".to_string()
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle returned by [`EventBus::subscribe`].
///
/// Holds only weak references: it neither keeps the bus alive nor the
/// listener registered.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    event_type: String,
    listener: Weak<Listener>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// True while the listener can still be invoked.
    pub fn is_active(&self) -> bool {
        self.listener
            .upgrade()
            .map(|l| l.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Removes the listener. Safe to call any number of times.
    ///
    /// Takes effect immediately, including for an `emit` already in progress.
    pub fn unsubscribe(&self) -> bool {
        if let Some(listener) = self.listener.upgrade() {
            listener.active.store(false, Ordering::Release);
        }

        self.bus
            .upgrade()
            .map(|bus| bus.detach(&self.event_type, self.id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("owner", &self.owner)
            .field("once", &self.once)
            .finish()
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorder(bus: &EventBus, event_type: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(event_type, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_emit_reaches_listeners_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            bus.on("balance.changed", move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        bus.emit("balance.changed", json!({ "balance": 500 }));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_wildcard_runs_after_direct_listeners() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.on(WILDCARD, move |e| {
            o.lock().unwrap().push(format!("*:{}", e.event_type));
            Ok(())
        });
        let o = order.clone();
        bus.on("a", move |_| {
            o.lock().unwrap().push("a".to_string());
            Ok(())
        });

        bus.emit("a", Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["a".to_string(), "*:a".to_string()]);
    }

    #[test]
    fn test_emitting_wildcard_dispatches_once() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.on(WILDCARD, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(WILDCARD, Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.once("tick", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("tick", Value::Null);
        bus.emit("tick", Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("tick"), 0);
    }

    #[test]
    fn test_once_listener_removed_even_when_it_fails() {
        let bus = EventBus::new();
        bus.once("tick", |_| Err("nope".into()));
        bus.emit("tick", Value::Null);
        assert_eq!(bus.listener_count("tick"), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sub = bus.on("x", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(sub.is_active());
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());

        bus.emit("x", Value::Null);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_during_emit_skips_later_listener() {
        let bus = EventBus::new();
        let second_calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let s = slot.clone();
        bus.on("x", move |_| {
            if let Some(sub) = s.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        let c = second_calls.clone();
        let second = bus.on("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        *slot.lock().unwrap() = Some(second);

        bus.emit("x", Value::Null);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_added_during_emit_waits_for_next_emit() {
        let bus = EventBus::new();
        let late_calls = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        let c = late_calls.clone();
        bus.once("x", move |_| {
            let c = c.clone();
            inner_bus.on("x", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        bus.emit("x", Value::Null);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        bus.emit("x", Value::Null);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_listener_is_isolated_and_reported() {
        let bus = EventBus::new();
        let errors = recorder(&bus, LISTENER_ERROR);

        bus.on("x", |_| Err("boom".into()));
        bus.on("x", |_| panic!("kaboom"));
        let after = Arc::new(AtomicUsize::new(0));
        let a = after.clone();
        bus.on("x", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("x", Value::Null);
        assert_eq!(after.load(Ordering::SeqCst), 1);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        let first: ListenerErrorPayload = errors[0].payload_as().unwrap();
        assert_eq!(first.event_type, "x");
        assert_eq!(first.message, "boom");
        assert!(!first.panicked);
        let second: ListenerErrorPayload = errors[1].payload_as().unwrap();
        assert!(second.panicked);
        assert!(second.message.contains("kaboom"));
    }

    #[test]
    fn test_failing_error_listener_does_not_recurse() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.on(LISTENER_ERROR, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("still broken".into())
        });
        bus.on("x", |_| Err("boom".into()));

        bus.emit("x", Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_wildcard_listener_terminates() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.on(WILDCARD, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("broken".into())
        });

        bus.emit("x", Value::Null);
        // once for "x", once for the listener_error it caused
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_on_error() {
        let bus = EventBus::new();
        let sub = bus.subscribe(
            "x",
            |_| Err("bad".into()),
            SubscribeOptions::new().unsubscribe_on_error(),
        );

        bus.emit("x", Value::Null);
        assert!(!sub.is_active());
        assert_eq!(bus.listener_count("x"), 0);
    }

    #[test]
    fn test_remove_owned_by() {
        let bus = EventBus::new();
        bus.subscribe("a", |_| Ok(()), SubscribeOptions::new().owned_by("Home"));
        bus.subscribe("b", |_| Ok(()), SubscribeOptions::new().owned_by("Home"));
        bus.subscribe("a", |_| Ok(()), SubscribeOptions::new().owned_by("Settings"));
        bus.on("a", |_| Ok(()));

        assert_eq!(bus.remove_owned_by("Home"), 2);
        assert_eq!(bus.remove_owned_by("Home"), 0);
        assert_eq!(bus.listener_count("a"), 2);
        assert_eq!(bus.listener_count("b"), 0);
    }

    #[test]
    fn test_emit_typed() {
        #[derive(Serialize)]
        struct Balance {
            balance: u32,
        }

        let bus = EventBus::new();
        let seen = recorder(&bus, "balance.changed");
        bus.emit_typed("balance.changed", &Balance { balance: 500 }).unwrap();

        assert_eq!(seen.lock().unwrap()[0].payload, json!({ "balance": 500 }));
    }

    #[test]
    fn test_clear_removes_everything() {
        let bus = EventBus::new();
        let sub = bus.on("a", |_| Ok(()));
        bus.on(WILDCARD, |_| Ok(()));
        bus.clear();
        assert_eq!(bus.total_listeners(), 0);
        assert!(!sub.is_active());
    }
}
