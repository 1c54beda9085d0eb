//! # tally-sync: Event, Cache and Offline Sync Engine
//!
//! Client-side state plumbing for an offline-capable app: an in-process
//! event bus, a TTL cache, component lifecycle cleanup, connectivity
//! tracking, and a durable queue that replays mutations once the network
//! comes back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Engine Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncRuntime (wires everything)                 │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   EventBus     │  │   TtlCache     │  │  ComponentRegistry     │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Sync dispatch, │  │ Lazy expiry,   │  │ Unmount drops owned    │    │
//! │  │ "*" wildcard,  │  │ prefix clear,  │  │ listeners and cache    │    │
//! │  │ isolated       │  │ sweeper        │  │ keys                   │    │
//! │  │ listeners      │  │                │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌──────────────────────────────────────────────┐  │
//! │  │ Connectivity   │  │              SyncQueue                        │  │
//! │  │ Monitor        │  │                                               │  │
//! │  │                │──►│ Durable FIFO, one drain at a time,          │  │
//! │  │ Online/Offline │  │ per-kind handlers, bounded retries           │  │
//! │  └────────────────┘  └──────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  EVENTS (on the bus):                                                  │
//! │  • "component.mount" / "component.unmount"                            │
//! │  • "connectivity.restored" / "connectivity.lost"                      │
//! │  • "sync.enqueued", "sync.start", "sync.item_complete",               │
//! │    "sync.item_retry", "sync.item_dropped", "sync.no_handler",         │
//! │    "sync.complete"                                                     │
//! │  • "bus.listener_error"                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`bus`] - Event bus and subscriptions
//! - [`cache`] - TTL cache
//! - [`lifecycle`] - Component mount/unmount registry
//! - [`connectivity`] - Connectivity monitor and reachability sources
//! - [`handler`] - Sync handlers and the auth seam
//! - [`queue`] - Offline sync queue
//! - [`runtime`] - `SyncRuntime` and its builder
//! - [`config`] - Configuration (TOML file + environment)
//! - [`error`] - Error types
//! - [`telemetry`] - Tracing subscriber setup

pub mod bus;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod queue;
pub mod runtime;
pub mod telemetry;

pub use bus::{EventBus, ListenerError, ListenerResult, SubscribeOptions, Subscription};
pub use cache::TtlCache;
pub use config::{CacheSettings, ConnectivitySettings, QueueSettings, StorageSettings, SyncConfig};
pub use connectivity::{
    ConnectivityMonitor, ManualReachability, ReachabilityCallback, ReachabilitySource, TcpProbe,
    Transition,
};
pub use error::{SyncError, SyncResult};
pub use handler::{
    AuthBackend, AuthSession, HandlerContext, HandlerError, HandlerRegistry, HandlerResult,
    OperationHandler,
};
pub use lifecycle::{ComponentRegistry, UnmountReport};
pub use queue::{DrainOutcome, QueueDeps, SyncQueue};
pub use runtime::{SyncRuntime, SyncRuntimeBuilder};
pub use telemetry::init_tracing;
