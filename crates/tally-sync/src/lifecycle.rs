//! # Component Lifecycle Registry
//!
//! Tracks mounted UI components and cleans up after them.
//!
//! ## Unmount Cleanup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  on_unmount("Home", "home-1")                                           │
//! │                                                                         │
//! │  1. emit "component.unmount" { componentName, instanceId }             │
//! │  2. bus.remove_owned_by("Home")     every listener tagged owner=Home   │
//! │  3. cache.clear(Some("Home"))       every key starting with "Home"     │
//! │                                                                         │
//! │  Runs unconditionally: unmounting twice, or unmounting something that  │
//! │  was never mounted, is a no-op cleanup that still emits the event.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components should build their cache keys with [`ComponentRegistry::scoped_key`]
//! so the prefix clear finds them.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use tally_core::events::{ComponentPayload, COMPONENT_MOUNT, COMPONENT_UNMOUNT};
use tally_core::validation::validate_component_name;
use tally_core::Event;

use crate::bus::{EventBus, ListenerResult, SubscribeOptions, Subscription};
use crate::cache::TtlCache;
use crate::error::SyncResult;

/// What an unmount cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountReport {
    pub listeners_removed: usize,
    pub cache_entries_removed: usize,
}

/// Mount/unmount hooks for UI components.
#[derive(Debug)]
pub struct ComponentRegistry {
    bus: EventBus,
    cache: TtlCache,
    mounted: Mutex<HashMap<String, HashSet<String>>>,
}

impl ComponentRegistry {
    pub fn new(bus: EventBus, cache: TtlCache) -> Self {
        ComponentRegistry {
            bus,
            cache,
            mounted: Mutex::new(HashMap::new()),
        }
    }

    fn mounted(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.mounted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the instance and emits `component.mount`.
    pub fn on_mount(&self, component_name: &str, instance_id: &str) -> SyncResult<()> {
        validate_component_name(component_name)?;

        self.mounted()
            .entry(component_name.to_string())
            .or_default()
            .insert(instance_id.to_string());

        debug!(component = %component_name, instance = %instance_id, "Component mounted");
        self.emit(COMPONENT_MOUNT, component_name, instance_id)?;
        Ok(())
    }

    /// Emits `component.unmount`, then drops the component's listeners and
    /// cache entries.
    ///
    /// Cleanup is keyed on the component name, so unmounting one instance
    /// cleans up after all of them.
    pub fn on_unmount(&self, component_name: &str, instance_id: &str) -> SyncResult<UnmountReport> {
        // An empty name would clear the whole cache.
        validate_component_name(component_name)?;

        self.emit(COMPONENT_UNMOUNT, component_name, instance_id)?;

        let report = UnmountReport {
            listeners_removed: self.bus.remove_owned_by(component_name),
            cache_entries_removed: self.cache.clear(Some(component_name)),
        };

        {
            let mut mounted = self.mounted();
            if let Some(instances) = mounted.get_mut(component_name) {
                instances.remove(instance_id);
                if instances.is_empty() {
                    mounted.remove(component_name);
                }
            }
        }

        debug!(
            component = %component_name,
            instance = %instance_id,
            listeners = report.listeners_removed,
            cache_entries = report.cache_entries_removed,
            "Component unmounted"
        );
        Ok(report)
    }

    /// Subscribes a listener owned by `component_name`.
    pub fn subscribe_owned<F>(
        &self,
        component_name: &str,
        event_type: impl Into<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.bus.subscribe(
            event_type,
            callback,
            SubscribeOptions::new().owned_by(component_name),
        )
    }

    /// Cache key scoped to a component: `"{component}_{key}"`.
    pub fn scoped_key(component_name: &str, key: &str) -> String {
        format!("{}_{}", component_name, key)
    }

    pub fn is_mounted(&self, component_name: &str) -> bool {
        self.mounted().contains_key(component_name)
    }

    /// Mounted instance ids of a component, sorted.
    pub fn instances(&self, component_name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .mounted()
            .get(component_name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn emit(&self, event_type: &str, component_name: &str, instance_id: &str) -> SyncResult<()> {
        let payload = ComponentPayload {
            component_name: component_name.to_string(),
            instance_id: instance_id.to_string(),
        };
        self.bus.emit_typed(event_type, &payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> (ComponentRegistry, EventBus, TtlCache) {
        let bus = EventBus::new();
        let cache = TtlCache::new(Duration::from_secs(60)).unwrap();
        (ComponentRegistry::new(bus.clone(), cache.clone()), bus, cache)
    }

    #[test]
    fn test_unmount_removes_owned_listeners_and_cache() {
        let (registry, bus, cache) = registry();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.on_mount("Home", "home-1").unwrap();
        let c = calls.clone();
        registry.subscribe_owned("Home", "balance.changed", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        cache
            .set(ComponentRegistry::scoped_key("Home", "feed"), json!([1, 2]), None)
            .unwrap();
        cache.set("Settings_theme", json!("dark"), None).unwrap();

        let report = registry.on_unmount("Home", "home-1").unwrap();
        assert_eq!(report.listeners_removed, 1);
        assert_eq!(report.cache_entries_removed, 1);

        bus.emit("balance.changed", Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cache.get("Home_feed").is_none());
        assert!(cache.get("Settings_theme").is_some());
        assert!(!registry.is_mounted("Home"));
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let (registry, bus, _cache) = registry();
        let unmounts = Arc::new(AtomicUsize::new(0));
        let u = unmounts.clone();
        bus.on(COMPONENT_UNMOUNT, move |_| {
            u.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.on_unmount("Ghost", "g-1").unwrap();
        let second = registry.on_unmount("Ghost", "g-1").unwrap();
        assert_eq!(second, UnmountReport::default());
        assert_eq!(unmounts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mount_emits_payload() {
        let (registry, bus, _cache) = registry();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.on(COMPONENT_MOUNT, move |event| {
            *s.lock().unwrap() = Some(event.payload_as::<ComponentPayload>()?);
            Ok(())
        });

        registry.on_mount("Profile", "p-7").unwrap();
        let payload = seen.lock().unwrap().clone().unwrap();
        assert_eq!(payload.component_name, "Profile");
        assert_eq!(payload.instance_id, "p-7");
        assert_eq!(registry.instances("Profile"), vec!["p-7".to_string()]);
    }

    #[test]
    fn test_empty_component_name_rejected() {
        let (registry, _bus, cache) = registry();
        cache.set("anything", json!(1), None).unwrap();

        assert!(registry.on_unmount("", "x").is_err());
        assert_eq!(cache.len(), 1);
    }
}
