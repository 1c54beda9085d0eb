//! # Sync Runtime
//!
//! Owns and wires the engine's components; the single entry point for host
//! applications.
//!
//! ## Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncRuntime                                    │
//! │                                                                         │
//! │   ┌────────────┐   shared by everything                                │
//! │   │  EventBus  │◄──────────────────────────────────┐                   │
//! │   └────────────┘                                    │                   │
//! │         ▲                                           │                   │
//! │   ┌─────┴──────────┐   ┌────────────┐   ┌──────────┴─────────┐         │
//! │   │ComponentRegistry│──►│  TtlCache  │   │ ConnectivityMonitor│         │
//! │   └────────────────┘   └────────────┘   └──────────┬─────────┘         │
//! │                                                     │ restore hook      │
//! │   ReachabilitySource ──► attach() ──────────────────┘                   │
//! │                                                     ▼                   │
//! │   HandlerRegistry ─────────────────────────► ┌────────────┐            │
//! │   AuthBackend ───────────────────────────────►│ SyncQueue  │──► store   │
//! │                                               └────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let runtime = SyncRuntime::builder(SyncConfig::load(None)?)
//!     .with_reachability(Arc::new(reachability.clone()))
//!     .build()
//!     .await?;
//!
//! runtime.register_handler_fn("create_post", |data, ctx| async move {
//!     api.create_post(data, ctx.session).await.map_err(HandlerError::retryable)
//! })?;
//!
//! runtime.enqueue(Operation::new("create_post", json!({ "title": "hi" }))).await?;
//! ```

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tally_core::{Event, Operation, SyncStatus};
use tally_store::{Database, DbConfig, KeyValueStore};

use crate::bus::{EventBus, ListenerResult, SubscribeOptions, Subscription};
use crate::cache::TtlCache;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ReachabilitySource, TcpProbe};
use crate::error::{SyncError, SyncResult};
use crate::handler::{AuthBackend, HandlerContext, HandlerRegistry, HandlerResult, OperationHandler};
use crate::lifecycle::ComponentRegistry;
use crate::queue::{DrainOutcome, QueueDeps, SyncQueue};

/// The assembled engine.
pub struct SyncRuntime {
    config: SyncConfig,
    bus: EventBus,
    cache: TtlCache,
    components: ComponentRegistry,
    connectivity: Arc<ConnectivityMonitor>,
    handlers: HandlerRegistry,
    queue: SyncQueue,
    reachability: Option<Arc<dyn ReachabilitySource>>,
    sweeper: Option<JoinHandle<()>>,
}

impl SyncRuntime {
    pub fn builder(config: SyncConfig) -> SyncRuntimeBuilder {
        SyncRuntimeBuilder::new(config)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe<F>(
        &self,
        event_type: impl Into<String>,
        callback: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.bus.subscribe(event_type, callback, options)
    }

    pub fn emit(&self, event_type: &str, payload: Value) {
        self.bus.emit(event_type, payload)
    }

    // =========================================================================
    // Cache
    // =========================================================================

    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.cache.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) -> SyncResult<()> {
        self.cache.set(key, value, ttl)
    }

    pub fn clear(&self, prefix: Option<&str>) -> usize {
        self.cache.clear(prefix)
    }

    // =========================================================================
    // Offline Sync
    // =========================================================================

    pub async fn enqueue(&self, operation: Operation) -> SyncResult<String> {
        self.queue.enqueue(operation).await
    }

    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        self.queue.drain().await
    }

    pub fn register_handler(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> SyncResult<()> {
        self.handlers.register(kind, handler)
    }

    pub fn register_handler_fn<F, Fut>(&self, kind: impl Into<String>, handler: F) -> SyncResult<()>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register_fn(kind, handler)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.queue.status().await
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stops background work: periodic drains, the cache sweeper and the
    /// reachability source. A drain already in flight runs to completion.
    pub fn shutdown(&mut self) {
        info!("Sync runtime shutting down");
        self.stop_background();
    }

    fn stop_background(&mut self) {
        self.queue.stop_periodic_drain();

        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }

        if let Some(source) = self.reachability.take() {
            source.stop();
        }
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        self.stop_background();
    }
}

impl fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("bus", &self.bus)
            .field("cache", &self.cache)
            .field("connectivity", &self.connectivity)
            .field("queue", &self.queue)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncRuntime`].
pub struct SyncRuntimeBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    auth: Option<Arc<dyn AuthBackend>>,
    handlers: HandlerRegistry,
    reachability: Option<Arc<dyn ReachabilitySource>>,
}

impl SyncRuntimeBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncRuntimeBuilder {
            config,
            store: None,
            auth: None,
            handlers: HandlerRegistry::new(),
            reachability: None,
        }
    }

    /// Uses `store` instead of opening the configured SQLite database.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthBackend>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Registers a handler before the queue starts, so items restored from a
    /// previous run can drain right away.
    pub fn with_handler(
        self,
        kind: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> SyncResult<Self> {
        self.handlers.register(kind, handler)?;
        Ok(self)
    }

    /// Uses `source` instead of the configured TCP probe.
    pub fn with_reachability(mut self, source: Arc<dyn ReachabilitySource>) -> Self {
        self.reachability = Some(source);
        self
    }

    /// Builds the runtime. Must be called inside a Tokio runtime.
    pub async fn build(self) -> SyncResult<SyncRuntime> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_database(&config).await?,
        };

        let bus = EventBus::new();

        let mut cache = TtlCache::new(config.cache.default_ttl())?;
        if let Some(max) = config.cache.max_entries {
            cache = cache.with_max_entries(max)?;
        }

        let components = ComponentRegistry::new(bus.clone(), cache.clone());
        let connectivity = Arc::new(ConnectivityMonitor::new(
            bus.clone(),
            config.connectivity.initially_online,
        ));

        let queue = SyncQueue::open(
            QueueDeps {
                store,
                bus: bus.clone(),
                connectivity: connectivity.clone(),
                handlers: self.handlers.clone(),
                auth: self.auth,
            },
            config.queue.clone(),
        )
        .await?;

        let reachability = self.reachability.or_else(|| {
            config.connectivity.probe_addr.as_ref().map(|addr| {
                Arc::new(TcpProbe::new(
                    addr.clone(),
                    config.connectivity.probe_interval(),
                    config.connectivity.probe_timeout(),
                )) as Arc<dyn ReachabilitySource>
            })
        });

        if let Some(ref source) = reachability {
            connectivity.attach(source.as_ref())?;
        } else {
            debug!("No reachability source; connectivity changes must be reported manually");
        }

        if let Some(interval) = config.queue.drain_interval() {
            queue.start_periodic_drain(interval)?;
        }

        let sweeper = if config.cache.sweep_interval_secs > 0 {
            Some(cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs))?)
        } else {
            None
        };

        if connectivity.is_online() && !queue.is_empty().await {
            queue.spawn_drain("startup");
        }

        info!(
            online = connectivity.is_online(),
            pending = queue.len().await,
            "Sync runtime started"
        );

        Ok(SyncRuntime {
            config,
            bus,
            cache,
            components,
            connectivity,
            handlers: self.handlers,
            queue,
            reachability,
            sweeper,
        })
    }
}

async fn open_database(config: &SyncConfig) -> SyncResult<Arc<dyn KeyValueStore>> {
    let path = config.storage.resolve_database_path()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::Storage(format!("{}: {}", parent.display(), e)))?;
    }

    info!(?path, "Opening database");
    let db = Database::new(DbConfig::new(path)).await?;
    Ok(Arc::new(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_store::MemoryStore;

    fn quiet_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.queue.drain_interval_secs = 0;
        config.cache.sweep_interval_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_build_with_memory_store() {
        let runtime = SyncRuntime::builder(quiet_config())
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap();

        runtime.set("Home_feed", json!([1]), None).unwrap();
        assert_eq!(*runtime.get("Home_feed").unwrap(), json!([1]));
        assert_eq!(runtime.clear(Some("Home")), 1);

        let status = runtime.sync_status().await;
        assert!(!status.is_online);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = quiet_config();
        config.queue.max_retries = 0;

        let err = SyncRuntime::builder(config)
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_build_with_sqlite_file() {
        let dir = std::env::temp_dir().join(format!("tally-runtime-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut config = quiet_config();
        config.storage.database_path = Some(dir.join("tally.db"));

        let mut runtime = SyncRuntime::builder(config).build().await.unwrap();
        runtime
            .enqueue(Operation::new("create_post", json!({ "title": "hi" })))
            .await
            .unwrap();
        assert_eq!(runtime.queue().len().await, 1);

        runtime.shutdown();
        drop(runtime);
        let _ = std::fs::remove_dir_all(dir);
    }
}
