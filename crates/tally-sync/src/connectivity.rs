//! # Connectivity Monitor
//!
//! Two-state machine (Online / Offline) driven by an external reachability
//! signal.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │        report(true)                                                     │
//! │   ┌─────────────┐ ─────────────────────────────► ┌─────────────┐       │
//! │   │   OFFLINE   │   emit "connectivity.restored"  │   ONLINE    │       │
//! │   │             │   then run the restore hook     │             │       │
//! │   └─────────────┘ ◄───────────────────────────── └─────────────┘       │
//! │        ▲              report(false)                     │               │
//! │        │              emit "connectivity.lost"          │               │
//! │        └── report(false): no-op      report(true): no-op┘               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The restore hook is how the sync queue learns it should drain. The state
//! is also published on a `watch` channel for UI bindings.
//!
//! ## Reachability Sources
//! - [`ManualReachability`]: the host pushes changes (platform network APIs,
//!   tests).
//! - [`TcpProbe`]: periodically opens a TCP connection to a configured
//!   address.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tally_core::events::{CONNECTIVITY_LOST, CONNECTIVITY_RESTORED};
use tally_core::ConnectivityState;

use crate::bus::EventBus;
use crate::error::{SyncError, SyncResult};

/// Callback a reachability source invokes with `true` (reachable) or `false`.
pub type ReachabilityCallback = Box<dyn Fn(bool) + Send + Sync>;

type RestoreHook = Box<dyn Fn() + Send + Sync>;

/// Something that can tell whether the remote side is reachable.
pub trait ReachabilitySource: Send + Sync {
    /// Registers the callback. Sources call it on every observation; the
    /// monitor coalesces repeats.
    fn register(&self, callback: ReachabilityCallback) -> SyncResult<()>;

    /// Stops producing signals. Default is a no-op.
    fn stop(&self) {}
}

/// A state change produced by [`ConnectivityMonitor::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Restored,
    Lost,
}

// =============================================================================
// Monitor
// =============================================================================

/// Owns the process-wide connectivity state.
pub struct ConnectivityMonitor {
    bus: EventBus,
    state: watch::Sender<ConnectivityState>,
    on_restored: RwLock<Option<RestoreHook>>,
    attached: AtomicBool,
    /// Held across a state change and its event so transitions from racing
    /// sources are observed in the order they were applied.
    transition: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(bus: EventBus, initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState::new(initially_online));
        ConnectivityMonitor {
            bus,
            state,
            on_restored: RwLock::new(None),
            attached: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Installs the hook run once per Offline → Online transition.
    pub fn set_restore_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .on_restored
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Feeds one reachability observation into the state machine.
    ///
    /// Returns the transition it caused, or `None` if the state was already
    /// `reachable`. Listeners of the connectivity events must not call back
    /// into `report`.
    pub fn report(&self, reachable: bool) -> Option<Transition> {
        let _ordered = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let changed = self.state.send_if_modified(|state| {
            if state.is_online == reachable {
                false
            } else {
                *state = ConnectivityState::new(reachable);
                true
            }
        });

        if !changed {
            return None;
        }

        let snapshot = self.state();
        if reachable {
            info!("Connectivity restored");
            self.bus.emit_typed(CONNECTIVITY_RESTORED, &snapshot).ok();
            let hook = self.on_restored.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(hook) = hook.as_ref() {
                hook();
            }
            Some(Transition::Restored)
        } else {
            warn!("Connectivity lost");
            self.bus.emit_typed(CONNECTIVITY_LOST, &snapshot).ok();
            Some(Transition::Lost)
        }
    }

    /// Subscribes to `source`. A monitor accepts exactly one source.
    pub fn attach(self: &Arc<Self>, source: &dyn ReachabilitySource) -> SyncResult<()> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Err(SyncError::InvalidState(
                "a reachability source is already attached".into(),
            ));
        }

        let monitor: Weak<ConnectivityMonitor> = Arc::downgrade(self);
        let registered = source.register(Box::new(move |reachable| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.report(reachable);
            }
        }));

        if registered.is_err() {
            self.attached.store(false, Ordering::Release);
        }
        registered
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("attached", &self.attached.load(Ordering::Acquire))
            .finish()
    }
}

// =============================================================================
// Manual Source
// =============================================================================

/// Reachability pushed by the host application.
#[derive(Clone, Default)]
pub struct ManualReachability {
    callbacks: Arc<Mutex<Vec<Arc<dyn Fn(bool) + Send + Sync>>>>,
}

impl ManualReachability {
    pub fn new() -> Self {
        Self::default()
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<Arc<dyn Fn(bool) + Send + Sync>>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forwards an observation to every registered callback.
    pub fn set_reachable(&self, reachable: bool) {
        let callbacks = self.callbacks().clone();
        for callback in callbacks {
            callback(reachable);
        }
    }
}

impl ReachabilitySource for ManualReachability {
    fn register(&self, callback: ReachabilityCallback) -> SyncResult<()> {
        self.callbacks().push(Arc::from(callback));
        Ok(())
    }

    fn stop(&self) {
        self.callbacks().clear();
    }
}

impl fmt::Debug for ManualReachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualReachability")
            .field("callbacks", &self.callbacks().len())
            .finish()
    }
}

// =============================================================================
// TCP Probe
// =============================================================================

/// Periodically checks that a TCP connection to `addr` can be opened.
#[derive(Debug)]
pub struct TcpProbe {
    addr: String,
    interval: Duration,
    timeout: Duration,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        TcpProbe {
            addr: addr.into(),
            interval,
            timeout,
            shutdown: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One probe: true if the connection opened within `timeout`.
    pub async fn probe_once(addr: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Probe connection failed");
                false
            }
            Err(_) => {
                debug!(addr = %addr, ?timeout, "Probe timed out");
                false
            }
        }
    }
}

impl ReachabilitySource for TcpProbe {
    /// Starts the probe loop. The first probe runs immediately.
    fn register(&self, callback: ReachabilityCallback) -> SyncResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::NoRuntime("tcp probe"))?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let mut slot = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(SyncError::InvalidState("tcp probe already running".into()));
        }
        *slot = Some(shutdown_tx);

        let addr = self.addr.clone();
        let interval = self.interval;
        let timeout = self.timeout;

        info!(addr = %addr, ?interval, "Starting reachability probe");

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reachable = TcpProbe::probe_once(&addr, timeout).await;
                        callback(reachable);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(addr = %addr, "Reachability probe stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    fn stop(&self) {
        let tx = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the sender closes the channel and ends the loop.
        drop(tx);
    }
}

impl Drop for TcpProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tally_core::Event;

    fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.on("*", move |event: &Event| {
            s.lock().unwrap().push(event.event_type.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_transitions_emit_and_coalesce() {
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let monitor = ConnectivityMonitor::new(bus, false);

        assert_eq!(monitor.report(false), None);
        assert_eq!(monitor.report(true), Some(Transition::Restored));
        assert_eq!(monitor.report(true), None);
        assert_eq!(monitor.report(false), Some(Transition::Lost));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![CONNECTIVITY_RESTORED.to_string(), CONNECTIVITY_LOST.to_string()]
        );
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_restore_hook_runs_once_per_restore() {
        let monitor = ConnectivityMonitor::new(EventBus::new(), false);
        let drains = Arc::new(AtomicUsize::new(0));
        let d = drains.clone();
        monitor.set_restore_hook(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        monitor.report(true);
        monitor.report(true);
        monitor.report(false);
        assert_eq!(drains.load(Ordering::SeqCst), 1);

        monitor.report(true);
        assert_eq!(drains.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_racing_reports_emit_in_applied_order() {
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let monitor = Arc::new(ConnectivityMonitor::new(bus, false));

        let workers: Vec<_> = [true, false, true, false]
            .into_iter()
            .map(|reachable| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        monitor.report(reachable);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        for (i, event_type) in seen.iter().enumerate() {
            let expected = if i % 2 == 0 {
                CONNECTIVITY_RESTORED
            } else {
                CONNECTIVITY_LOST
            };
            assert_eq!(event_type, expected, "event {i} out of order");
        }

        let last_restored = seen.last().map(|t| t == CONNECTIVITY_RESTORED).unwrap_or(false);
        assert_eq!(last_restored, monitor.is_online());
    }

    #[test]
    fn test_attach_manual_source_once() {
        let monitor = Arc::new(ConnectivityMonitor::new(EventBus::new(), false));
        let source = ManualReachability::new();

        monitor.attach(&source).unwrap();
        assert!(monitor.attach(&source).is_err());

        let mut rx = monitor.watch();
        source.set_reachable(true);
        assert!(monitor.is_online());
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_online);
    }

    #[tokio::test]
    async fn test_probe_once_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe::probe_once(&addr, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!TcpProbe::probe_once(&addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_drives_monitor() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let monitor = Arc::new(ConnectivityMonitor::new(EventBus::new(), false));
        let probe = TcpProbe::new(addr, Duration::from_millis(20), Duration::from_secs(1));
        monitor.attach(&probe).unwrap();

        let mut rx = monitor.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_online))
            .await
            .unwrap()
            .unwrap();

        probe.stop();
    }
}
