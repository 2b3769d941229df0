//! # Time-Invalidated Cache
//!
//! Storage behind the permission and scope caches.
//!
//! Entries are keyed deterministically (`BTreeMap`) and carry the instant
//! they were fetched. Freshness is always decided against a `now` supplied
//! by the caller, which takes it from a [`crate::Clock`]. Nothing in this
//! module reads the wall clock.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Default lifetime of permission documents (one hour).
pub const DEFAULT_PERMISSIONS_TTL_SECS: i64 = 3600;

/// Default lifetime of rendering scopes (five minutes).
pub const DEFAULT_SCOPES_TTL_SECS: i64 = 300;

// =============================================================================
// CACHE ENTRY
// =============================================================================

/// An entry in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub value: T,

    /// When the value was fetched from its source.
    pub fetched_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn new(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self { value, fetched_at }
    }

    fn is_fresh(&self, ttl: TimeDelta, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }
}

// =============================================================================
// TTL CACHE
// =============================================================================

/// Cache whose entries expire a fixed time after they were fetched.
///
/// An expired entry is kept until it is replaced or cleared so callers can
/// fall back on it when a re-fetch fails.
#[derive(Debug, Clone)]
pub struct TtlCache<K: Ord + Clone, V> {
    entries: BTreeMap<K, CacheEntry<V>>,
    ttl: TimeDelta,
}

impl<K: Ord + Clone, V> TtlCache<K, V> {
    /// Create an empty cache with the given time to live.
    ///
    /// Negative durations are clamped to zero, which makes every entry stale.
    #[must_use]
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            entries: BTreeMap::new(),
            ttl: ttl.max(TimeDelta::zero()),
        }
    }

    /// Create a cache from a TTL expressed in seconds.
    #[must_use]
    pub fn with_ttl_secs(secs: i64) -> Self {
        Self::new(TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::zero()))
    }

    /// The configured time to live.
    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Store or replace a value, stamped with `now`.
    pub fn insert(&mut self, key: K, value: V, now: DateTime<Utc>) {
        self.entries.insert(key, CacheEntry::new(value, now));
    }

    /// Get a value regardless of its age.
    #[must_use]
    pub fn get_any(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Whether an entry exists and is younger than the TTL.
    #[must_use]
    pub fn is_fresh(&self, key: &K, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.is_fresh(self.ttl, now))
    }

    /// When the entry was fetched, if present.
    #[must_use]
    pub fn fetched_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.fetched_at)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if a key exists, fresh or not.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 7, 8, 9, 20, 22).unwrap()
    }

    #[test]
    fn fresh_entry_is_returned() {
        let mut cache = TtlCache::with_ttl_secs(60);
        cache.insert("1", "perms", t0());

        assert!(cache.is_fresh(&"1", t0() + TimeDelta::seconds(59)));
        assert_eq!(cache.get_any(&"1"), Some(&"perms"));
        assert!(!cache.is_fresh(&"2", t0()));
        assert_eq!(cache.get_any(&"2"), None);
    }

    #[test]
    fn entry_expires_at_ttl() {
        let mut cache = TtlCache::with_ttl_secs(60);
        cache.insert("1", "perms", t0());

        assert!(!cache.is_fresh(&"1", t0() + TimeDelta::seconds(60)));
        assert!(!cache.is_fresh(&"1", t0() + TimeDelta::seconds(61)));
        // stale value stays reachable for fallback
        assert!(cache.contains(&"1"));
        assert_eq!(cache.get_any(&"1"), Some(&"perms"));
    }

    #[test]
    fn zero_ttl_is_always_stale() {
        let mut cache = TtlCache::with_ttl_secs(0);
        cache.insert(1u8, (), t0());
        assert!(!cache.is_fresh(&1, t0()));

        let negative: TtlCache<u8, ()> = TtlCache::with_ttl_secs(-5);
        assert_eq!(negative.ttl(), TimeDelta::zero());
    }

    #[test]
    fn reinsert_refreshes_timestamp() {
        let mut cache = TtlCache::with_ttl_secs(10);
        cache.insert("k", 1, t0());
        let later = t0() + TimeDelta::seconds(30);
        assert!(!cache.is_fresh(&"k", later));

        cache.insert("k", 2, later);
        assert!(cache.is_fresh(&"k", later));
        assert_eq!(cache.fetched_at(&"k"), Some(later));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_drops_stale_and_fresh_entries() {
        let mut cache = TtlCache::with_ttl_secs(10);
        cache.insert(1u64, "a", t0());
        cache.insert(2u64, "b", t0() + TimeDelta::seconds(20));

        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.contains(&1));
        assert_eq!(cache.fetched_at(&2), None);
    }
}
