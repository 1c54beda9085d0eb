//! # TTL Cache
//!
//! In-memory key/value cache with per-entry time-to-live.
//!
//! ## Expiration
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Entry Lifetime                                  │
//! │                                                                         │
//! │  set(k, v, ttl)          get(k)               get(k)                   │
//! │       │                    │                    │                       │
//! │  ─────●────────────────────●────────────────────●──────────────► time  │
//! │       written_at           elapsed <= ttl       elapsed > ttl           │
//! │                            → Some(v)            → evict, None           │
//! │                                                                         │
//! │  Expired entries are removed lazily on read, or in bulk by             │
//! │  purge_expired() / the background sweeper.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are handed out as `Arc<V>`. Readers share the stored value, so an
//! update means calling `set` again, never mutating through the `Arc`.
//!
//! Time comes from `tokio::time::Instant`, which follows the paused clock in
//! tests.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use tally_core::validation::validate_ttl;

use crate::error::{SyncError, SyncResult};

struct CacheEntry<V> {
    value: Arc<V>,
    written_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) > self.ttl
    }
}

type Table<V> = HashMap<String, CacheEntry<V>>;

/// Shared TTL cache. Cheap to clone; clones share the table.
pub struct TtlCache<V = Value> {
    entries: Arc<Mutex<Table<V>>>,
    default_ttl: Duration,
    max_entries: Option<usize>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        TtlCache {
            entries: self.entries.clone(),
            default_ttl: self.default_ttl,
            max_entries: self.max_entries,
        }
    }
}

fn lock<V>(entries: &Mutex<Table<V>>) -> MutexGuard<'_, Table<V>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V> TtlCache<V> {
    /// Creates an unbounded cache. `default_ttl` must be non-zero.
    pub fn new(default_ttl: Duration) -> SyncResult<Self> {
        validate_ttl(default_ttl)?;
        Ok(TtlCache {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
            max_entries: None,
        })
    }

    /// Bounds the number of entries. When full, expired entries are purged
    /// first, then the oldest write is evicted.
    pub fn with_max_entries(mut self, max_entries: usize) -> SyncResult<Self> {
        if max_entries == 0 {
            return Err(SyncError::InvalidConfig(
                "cache max_entries must be greater than 0".into(),
            ));
        }
        self.max_entries = Some(max_entries);
        Ok(self)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// `ttl` falls back to the cache default; a zero ttl is rejected.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> SyncResult<()> {
        self.set_shared(key, Arc::new(value), ttl)
    }

    /// Like [`set`](Self::set) for a value that is already shared.
    pub fn set_shared(
        &self,
        key: impl Into<String>,
        value: Arc<V>,
        ttl: Option<Duration>,
    ) -> SyncResult<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        validate_ttl(ttl)?;

        let key = key.into();
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        if let Some(max) = self.max_entries {
            if !entries.contains_key(&key) && entries.len() >= max {
                entries.retain(|_, entry| !entry.is_expired(now));
                if entries.len() >= max {
                    evict_oldest(&mut entries);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                written_at: now,
                ttl,
            },
        );
        Ok(())
    }

    /// Returns the live value, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// True if `key` holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes `key`. Returns true if an entry (live or expired) was present.
    pub fn remove(&self, key: &str) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    /// Removes every entry, or only the keys starting with `prefix`.
    /// Returns how many entries were removed.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();

        match prefix {
            None => entries.clear(),
            Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
        }

        before - entries.len()
    }

    /// Stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

impl<V: Send + Sync + 'static> TtlCache<V> {
    /// Spawns a task that purges expired entries every `interval`.
    ///
    /// The task ends on its own once every clone of the cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> SyncResult<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::NoRuntime("cache sweeper"))?;
        let entries: Weak<Mutex<Table<V>>> = Arc::downgrade(&self.entries);

        Ok(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(entries) = entries.upgrade() else {
                    debug!("Cache dropped, stopping sweeper");
                    break;
                };

                let now = Instant::now();
                let mut table = lock(&entries);
                let before = table.len();
                table.retain(|_, entry| !entry.is_expired(now));
                let purged = before - table.len();

                if purged > 0 {
                    debug!(purged, remaining = table.len(), "Swept expired cache entries");
                }
            }
        }))
    }
}

fn evict_oldest<V>(entries: &mut Table<V>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.written_at)
        .map(|(key, _)| key.clone());

    if let Some(key) = oldest {
        debug!(key = %key, "Cache full, evicting oldest entry");
        entries.remove(&key);
    }
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.len())
            .field("default_ttl", &self.default_ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> TtlCache {
        TtlCache::new(Duration::from_secs(300)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = cache();
        cache
            .set("user_42", json!({ "name": "Ada" }), Some(Duration::from_millis(100)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(*cache.get("user_42").unwrap(), json!({ "name": "Ada" }));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.get("user_42").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let cache = TtlCache::new(Duration::from_secs(1)).unwrap();
        cache.set("k", 1u32, None).unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.contains("k"));
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_resets_ttl() {
        let cache = cache();
        cache.set("k", json!(1), Some(Duration::from_millis(100))).unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set("k", json!(2), Some(Duration::from_millis(100))).unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(*cache.get("k").unwrap(), json!(2));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let cache = cache();
        let err = cache.set("k", json!(1), Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(TtlCache::<Value>::new(Duration::ZERO).is_err());
    }

    #[test]
    fn test_clear_with_prefix_is_strict() {
        let cache = cache();
        cache.set("Home_feed", json!(1), None).unwrap();
        cache.set("Home_user", json!(2), None).unwrap();
        cache.set("Settings_theme", json!(3), None).unwrap();
        cache.set("user_Home", json!(4), None).unwrap();

        assert_eq!(cache.clear(Some("Home")), 2);
        assert!(cache.get("Home_feed").is_none());
        assert!(cache.get("Settings_theme").is_some());
        assert!(cache.get("user_Home").is_some());

        assert_eq!(cache.clear(None), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache();
        cache.set("short", json!(1), Some(Duration::from_millis(10))).unwrap();
        cache.set("long", json!(2), Some(Duration::from_secs(10))).unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries_evicts_oldest() {
        let cache = cache().with_max_entries(2).unwrap();
        cache.set("a", json!(1), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("b", json!(2), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("c", json!(3), None).unwrap();

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());

        // Overwriting an existing key never evicts.
        cache.set("c", json!(4), None).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let cache = cache();
        cache.set("k", json!(1), Some(Duration::from_millis(10))).unwrap();
        let sweeper = cache.spawn_sweeper(Duration::from_millis(50)).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.len(), 0);

        sweeper.abort();
    }

    #[test]
    fn test_values_are_shared() {
        let cache = cache();
        cache.set("k", json!({ "n": 1 }), None).unwrap();
        let a = cache.get("k").unwrap();
        let b = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
