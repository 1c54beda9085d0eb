//! # Offline Sync Queue
//!
//! Durable FIFO of operations waiting to be pushed to the remote side.
//!
//! ## Queue Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Offline Sync Flow                                │
//! │                                                                         │
//! │  enqueue(op)                                                           │
//! │     │  lock ─► push ─► persist ─► unlock                               │
//! │     │  emit "sync.enqueued"                                            │
//! │     └─ online and idle? ─► spawn drain                                 │
//! │                                                                         │
//! │  drain()   (also: connectivity restored, periodic timer)               │
//! │     │  claim the in-flight flag (or return AlreadyRunning)             │
//! │     │  offline? ─► return Offline                                      │
//! │     │  emit "sync.start", snapshot items, fetch auth session           │
//! │     │                                                                   │
//! │     │  for item in snapshot (FIFO):                                    │
//! │     │     handler(kind)(data, ctx)          ◄── no lock held           │
//! │     │     ├── Ok        ─► remove, persist, "sync.item_complete"       │
//! │     │     ├── Err       ─► retry_count += 1                            │
//! │     │     │     exhausted or permanent ─► remove, persist, dropped     │
//! │     │     │     otherwise              ─► persist, "sync.item_retry"   │
//! │     │     └── no handler ─► "sync.no_handler", counts as Err           │
//! │     │                                                                   │
//! │     └─ emit "sync.complete" { succeeded, retried, dropped }            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Persistence
//! The whole queue is written under one key after every mutation and before
//! the matching event is emitted. The async mutex is held across the change
//! and its write, so memory and disk never disagree. A write that keeps
//! failing is retried with exponential backoff, then the change is rolled
//! back and the error returned.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tally_core::events::{
    DrainStartPayload, EnqueuedPayload, ItemCompletePayload, ItemDroppedPayload, ItemRetryPayload,
    NoHandlerPayload, SYNC_COMPLETE, SYNC_ENQUEUED, SYNC_ITEM_COMPLETE, SYNC_ITEM_DROPPED,
    SYNC_ITEM_RETRY, SYNC_NO_HANDLER, SYNC_START,
};
use tally_core::validation::validate_operation_kind;
use tally_core::{DrainReport, ItemOutcome, Operation, SyncQueueItem, SyncStatus};
use tally_store::{load_json, save_json, KeyValueStore};

use crate::bus::EventBus;
use crate::config::QueueSettings;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::handler::{AuthBackend, AuthSession, HandlerContext, HandlerError, HandlerRegistry};

// =============================================================================
// Drain Outcome
// =============================================================================

/// Result of a call to [`SyncQueue::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The drain ran over its snapshot.
    Completed(DrainReport),
    /// Another drain was in flight; nothing was done.
    AlreadyRunning,
    /// Offline; nothing was done.
    Offline,
}

/// Clears the in-flight flag on every exit path, panics included.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Collaborators the queue needs.
#[derive(Clone)]
pub struct QueueDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub bus: EventBus,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub handlers: HandlerRegistry,
    pub auth: Option<Arc<dyn AuthBackend>>,
}

struct QueueInner {
    items: Mutex<Vec<SyncQueueItem>>,
    deps: QueueDeps,
    settings: QueueSettings,
    draining: AtomicBool,
    last_drain_at: StdMutex<Option<DateTime<Utc>>>,
    periodic: StdMutex<Option<mpsc::Sender<()>>>,
    /// Runtime the queue was opened on. Background drains go here, since
    /// reachability callbacks may arrive on threads outside any runtime.
    runtime: Handle,
}

/// The offline sync queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl SyncQueue {
    /// Opens the queue, restoring any items persisted by a previous run, and
    /// hooks it to the connectivity monitor.
    pub async fn open(deps: QueueDeps, settings: QueueSettings) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime("sync queue"))?;

        let restored: Vec<SyncQueueItem> =
            load_json(deps.store.as_ref(), &settings.storage_key)
                .await?
                .unwrap_or_default();

        if restored.is_empty() {
            debug!(key = %settings.storage_key, "No persisted sync items");
        } else {
            info!(count = restored.len(), "Restored persisted sync queue");
        }

        let queue = SyncQueue {
            inner: Arc::new(QueueInner {
                items: Mutex::new(restored),
                deps,
                settings,
                draining: AtomicBool::new(false),
                last_drain_at: StdMutex::new(None),
                periodic: StdMutex::new(None),
                runtime,
            }),
        };

        let weak = Arc::downgrade(&queue.inner);
        queue.inner.deps.connectivity.set_restore_hook(move || {
            if let Some(inner) = weak.upgrade() {
                SyncQueue { inner }.spawn_drain("connectivity restored");
            }
        });

        Ok(queue)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Appends an operation and makes it durable. Returns the item id.
    ///
    /// If online and no drain is running, a drain is started in the
    /// background.
    pub async fn enqueue(&self, operation: Operation) -> SyncResult<String> {
        validate_operation_kind(&operation.kind)?;

        let item = SyncQueueItem::new(operation, self.inner.settings.max_retries);
        let id = item.id.clone();
        let kind = item.operation.kind.clone();

        let queue_length = self
            .mutate(move |items| {
                items.push(item);
                items.len()
            })
            .await?;

        debug!(id = %id, kind = %kind, queue_length, "Operation enqueued");
        self.emit(
            SYNC_ENQUEUED,
            &EnqueuedPayload {
                id: id.clone(),
                kind,
                queue_length,
            },
        );

        if self.inner.deps.connectivity.is_online() && !self.is_draining() {
            self.spawn_drain("enqueue");
        }

        Ok(id)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    /// Attempts every item present when the drain starts, in FIFO order.
    ///
    /// Handler failures are reported through events, never as `Err`. An
    /// `Err` means the queue could not be persisted; the drain stops there
    /// and the failed change is rolled back.
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
            debug!("Drain already in flight");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        if !self.inner.deps.connectivity.is_online() {
            debug!("Offline, skipping drain");
            return Ok(DrainOutcome::Offline);
        }

        let snapshot = self.inner.items.lock().await.clone();
        self.emit(
            SYNC_START,
            &DrainStartPayload {
                queue_length: snapshot.len(),
            },
        );
        info!(items = snapshot.len(), "Drain started");

        let session = self.resolve_session().await;
        let mut report = DrainReport::default();

        for item in snapshot {
            if let Some(outcome) = self.process(item, session.as_ref()).await? {
                report.record(outcome);
            }
        }

        if let Ok(mut last) = self.inner.last_drain_at.lock() {
            *last = Some(Utc::now());
        }

        info!(
            succeeded = report.succeeded,
            retried = report.retried,
            dropped = report.dropped,
            "Drain complete"
        );
        self.emit(SYNC_COMPLETE, &report);

        Ok(DrainOutcome::Completed(report))
    }

    /// Starts a drain on the queue's runtime without waiting for it. Safe to
    /// call from any thread.
    pub fn spawn_drain(&self, reason: &'static str) -> JoinHandle<()> {
        let queue = self.clone();
        self.inner.runtime.spawn(async move {
            debug!(reason, "Background drain");
            if let Err(e) = queue.drain().await {
                error!(reason, error = %e, "Background drain failed");
            }
        })
    }

    async fn resolve_session(&self) -> Option<AuthSession> {
        let auth = self.inner.deps.auth.as_ref()?;

        match auth.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Auth backend failed, draining without a session");
                None
            }
        }
    }

    /// Runs one item through its handler and records the result.
    ///
    /// `None` if the item left the queue while its handler ran.
    async fn process(
        &self,
        item: SyncQueueItem,
        session: Option<&AuthSession>,
    ) -> SyncResult<Option<ItemOutcome>> {
        let result = match self.inner.deps.handlers.get(item.kind()) {
            Some(handler) => {
                let ctx = HandlerContext {
                    item_id: item.id.clone(),
                    attempt: item.retry_count + 1,
                    enqueued_at: item.enqueued_at,
                    session: session.cloned(),
                };

                AssertUnwindSafe(handler.handle(item.operation.data.clone(), ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::retryable("handler panicked")))
            }
            None => {
                warn!(id = %item.id, kind = %item.kind(), "sync.no_handler");
                self.emit(
                    SYNC_NO_HANDLER,
                    &NoHandlerPayload {
                        id: item.id.clone(),
                        kind: item.kind().to_string(),
                    },
                );
                Err(HandlerError::retryable(format!(
                    "no handler registered for '{}'",
                    item.kind()
                )))
            }
        };

        match result {
            Ok(()) => self.complete(&item).await,
            Err(err) => self.fail(&item, err).await,
        }
    }

    async fn complete(&self, item: &SyncQueueItem) -> SyncResult<Option<ItemOutcome>> {
        let id = item.id.clone();
        let removed = self
            .mutate(move |items| {
                let before = items.len();
                items.retain(|i| i.id != id);
                items.len() != before
            })
            .await?;

        if !removed {
            return Ok(None);
        }

        debug!(id = %item.id, kind = %item.kind(), "Item synced");
        self.emit(
            SYNC_ITEM_COMPLETE,
            &ItemCompletePayload {
                id: item.id.clone(),
                kind: item.kind().to_string(),
            },
        );
        Ok(Some(ItemOutcome::Synced))
    }

    async fn fail(&self, item: &SyncQueueItem, err: HandlerError) -> SyncResult<Option<ItemOutcome>> {
        let id = item.id.clone();
        let retryable = err.retryable;

        let updated = self
            .mutate(move |items| {
                let pos = items.iter().position(|i| i.id == id)?;
                let exhausted = items[pos].record_failure() || !retryable;
                let updated = items[pos].clone();
                if exhausted {
                    items.remove(pos);
                }
                Some((updated, exhausted))
            })
            .await?;

        let Some((updated, dropped)) = updated else {
            return Ok(None);
        };

        if dropped {
            warn!(
                id = %updated.id,
                kind = %updated.kind(),
                retry_count = updated.retry_count,
                error = %err,
                "Item dropped"
            );
            self.emit(
                SYNC_ITEM_DROPPED,
                &ItemDroppedPayload {
                    id: updated.id.clone(),
                    operation: updated.operation.clone(),
                    retry_count: updated.retry_count,
                    error: err.message,
                },
            );
            Ok(Some(ItemOutcome::Dropped))
        } else {
            debug!(
                id = %updated.id,
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                error = %err,
                "Item will be retried"
            );
            self.emit(
                SYNC_ITEM_RETRY,
                &ItemRetryPayload {
                    id: updated.id.clone(),
                    kind: updated.kind().to_string(),
                    retry_count: updated.retry_count,
                    max_retries: updated.max_retries,
                    error: err.message,
                },
            );
            Ok(Some(ItemOutcome::Retried))
        }
    }

    // =========================================================================
    // Periodic Drain
    // =========================================================================

    /// Drains every `interval` while online and non-empty. Replaces any
    /// running timer.
    pub fn start_periodic_drain(&self, interval: Duration) -> SyncResult<()> {
        let runtime = self.inner.runtime.clone();

        self.stop_periodic_drain();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        if let Ok(mut slot) = self.inner.periodic.lock() {
            *slot = Some(shutdown_tx);
        }

        let weak = Arc::downgrade(&self.inner);
        info!(?interval, "Starting periodic drain");

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        SyncQueue { inner }.periodic_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Periodic drain stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Prevents future timer drains. A drain already running finishes.
    /// Returns true if a timer was running.
    pub fn stop_periodic_drain(&self) -> bool {
        let tx = self
            .inner
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tx.is_some()
    }

    async fn periodic_tick(&self) {
        if !self.inner.deps.connectivity.is_online() || self.is_empty().await {
            return;
        }

        if let Err(e) = self.drain().await {
            error!(error = %e, "Periodic drain failed");
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> SyncStatus {
        let items = self.inner.items.lock().await;
        SyncStatus {
            is_online: self.inner.deps.connectivity.is_online(),
            queue_length: items.len(),
            pending_items: items.iter().map(SyncQueueItem::summary).collect(),
            is_draining: self.is_draining(),
            last_drain_at: self.last_drain_at(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the queued items in FIFO order.
    pub async fn pending(&self) -> Vec<SyncQueueItem> {
        self.inner.items.lock().await.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn last_drain_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .last_drain_at
            .lock()
            .map(|last| *last)
            .unwrap_or_default()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Applies `change` and persists the result under the queue lock. On
    /// persistence failure the queue is restored to its previous contents.
    async fn mutate<R, F>(&self, change: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Vec<SyncQueueItem>) -> R,
    {
        let mut items = self.inner.items.lock().await;
        let previous = items.clone();
        let result = change(&mut items);

        if let Err(e) = self.persist(&items).await {
            *items = previous;
            return Err(e);
        }
        Ok(result)
    }

    async fn persist(&self, items: &[SyncQueueItem]) -> SyncResult<()> {
        let settings = &self.inner.settings;
        let store = self.inner.deps.store.as_ref();

        let mut backoff = ExponentialBackoff {
            initial_interval: settings.persist_backoff(),
            max_interval: settings.persist_backoff() * 8,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match save_json(store, &settings.storage_key, items).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < settings.persist_attempts && e.is_transient() => {
                    let delay = backoff.next_backoff().unwrap_or(settings.persist_backoff());
                    warn!(attempt, ?delay, error = %e, "Queue write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Queue write failed, rolling back");
                    return Err(SyncError::PersistenceFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn emit<T: serde::Serialize>(&self, event_type: &str, payload: &T) {
        if let Err(e) = self.inner.deps.bus.emit_typed(event_type, payload) {
            warn!(event_type, error = %e, "Could not encode event payload");
        }
    }
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("storage_key", &self.inner.settings.storage_key)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tally_store::MemoryStore;

    async fn open_queue(online: bool) -> (SyncQueue, Arc<MemoryStore>, HandlerRegistry) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let handlers = HandlerRegistry::new();
        let deps = QueueDeps {
            store: store.clone(),
            bus: bus.clone(),
            connectivity: Arc::new(ConnectivityMonitor::new(bus, online)),
            handlers: handlers.clone(),
            auth: None,
        };
        let queue = SyncQueue::open(deps, QueueSettings::default()).await.unwrap();
        (queue, store, handlers)
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let (queue, store, _handlers) = open_queue(false).await;

        let id = queue
            .enqueue(Operation::new("create_post", json!({ "title": "hi" })))
            .await
            .unwrap();

        let persisted: Vec<SyncQueueItem> = load_json(store.as_ref(), "offline_sync_queue")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);
        assert_eq!(persisted[0].retry_count, 0);
        assert_eq!(persisted[0].max_retries, 3);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_kind() {
        let (queue, store, _handlers) = open_queue(false).await;
        assert!(queue.enqueue(Operation::new("", json!(null))).await.is_err());
        assert!(queue.is_empty().await);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_offline_does_nothing() {
        let (queue, _store, handlers) = open_queue(false).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        handlers
            .register_fn("create_post", move |_data, _ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();

        queue.enqueue(Operation::new("create_post", json!({}))).await.unwrap();
        assert_eq!(queue.drain().await.unwrap(), DrainOutcome::Offline);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len().await, 1);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_restores_persisted_items() {
        let store = Arc::new(MemoryStore::new());
        let item = SyncQueueItem::new(Operation::new("like", json!({ "post": 9 })), 3);
        save_json(store.as_ref(), "offline_sync_queue", &vec![item.clone()])
            .await
            .unwrap();

        let bus = EventBus::new();
        let deps = QueueDeps {
            store: store.clone(),
            bus: bus.clone(),
            connectivity: Arc::new(ConnectivityMonitor::new(bus, false)),
            handlers: HandlerRegistry::new(),
            auth: None,
        };
        let queue = SyncQueue::open(deps, QueueSettings::default()).await.unwrap();

        assert_eq!(queue.pending().await, vec![item]);
    }

    #[tokio::test]
    async fn test_corrupt_persisted_queue_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set("offline_sync_queue", "{not json").await.unwrap();

        let bus = EventBus::new();
        let deps = QueueDeps {
            store,
            bus: bus.clone(),
            connectivity: Arc::new(ConnectivityMonitor::new(bus, false)),
            handlers: HandlerRegistry::new(),
            auth: None,
        };
        let err = SyncQueue::open(deps, QueueSettings::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::CorruptQueue(_)));
    }

    #[tokio::test]
    async fn test_permanent_error_drops_immediately() {
        let (queue, _store, handlers) = open_queue(false).await;
        handlers
            .register_fn("create_post", |_data, _ctx| async {
                Err(HandlerError::permanent("rejected by server"))
            })
            .unwrap();
        queue.enqueue(Operation::new("create_post", json!({}))).await.unwrap();

        queue.inner.deps.connectivity.set_restore_hook(|| {});
        queue.inner.deps.connectivity.report(true);

        let outcome = queue.drain().await.unwrap();
        let DrainOutcome::Completed(report) = outcome else {
            panic!("expected a completed drain, got {:?}", outcome);
        };
        assert_eq!(report.dropped, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_status_reports_pending_items() {
        let (queue, _store, _handlers) = open_queue(false).await;
        queue.enqueue(Operation::new("a", json!(1))).await.unwrap();
        queue.enqueue(Operation::new("b", json!(2))).await.unwrap();

        let status = queue.status().await;
        assert!(!status.is_online);
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.pending_items[0].kind, "a");
        assert_eq!(status.pending_items[1].kind, "b");
        assert!(!status.is_draining);
        assert_eq!(status.last_drain_at, None);
    }

    #[test]
    fn test_drain_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let guard = DrainGuard::acquire(&flag);
            assert!(guard.is_some());
            assert!(DrainGuard::acquire(&flag).is_none());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
