//! Result cache for metadata lookups.
//!
//! Repeated uploads of the same bytes and repeated `get` calls resolve to
//! the same immutable metadata record, so the serialized record is kept in
//! memory keyed by content hash. The cache only ever short-circuits reads;
//! turning it off changes timing, never output.
//!
//! # Keys
//!
//! Callers pass logical keys such as `metadata:<hash>` (see
//! [`metadata_key`]). The configured `cache.prefix` is prepended internally,
//! so two optimizers with different prefixes can share a process without
//! seeing each other's entries.
//!
//! # Expiry
//!
//! Every entry carries its own time-to-live. `put` without an explicit TTL
//! uses `cache.ttl`. Capacity is bounded by `cache.max_entries`; moka evicts
//! least-recently-used entries past that.
//!
//! # Disabled cache
//!
//! With `cache.enabled = false`, `get` always misses, `put`/`forget`/`flush`
//! do nothing, and `remember` always calls its supplier.

use crate::config::CacheConfig;
use crate::store::ContentHash;
use moka::Expiry;
use moka::sync::Cache;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Logical cache key of a hash's metadata record.
pub fn metadata_key(hash: &ContentHash) -> String {
    format!("metadata:{hash}")
}

#[derive(Clone)]
struct Entry {
    payload: Arc<str>,
    ttl: Duration,
}

/// Reads each entry's own TTL.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Memoizing string cache with per-entry expiry.
pub struct ResultCache {
    inner: Option<Cache<String, Entry>>,
    prefix: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .expire_after(PerEntryTtl)
                .build()
        });
        Self {
            inner,
            prefix: config.prefix.clone(),
            default_ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let found = self
            .inner
            .as_ref()
            .and_then(|c| c.get(&self.full_key(key)))
            .map(|e| e.payload.to_string());
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a value; `ttl` defaults to `cache.ttl`.
    pub fn put(&self, key: &str, value: impl Into<Arc<str>>, ttl: Option<Duration>) {
        if let Some(cache) = &self.inner {
            let entry = Entry {
                payload: value.into(),
                ttl: ttl.unwrap_or(self.default_ttl),
            };
            cache.insert(self.full_key(key), entry);
        }
    }

    pub fn forget(&self, key: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(&self.full_key(key));
        }
    }

    /// Cached value for `key`, or the supplier's value, which is stored.
    /// Supplier errors are returned as-is and nothing is stored.
    pub fn remember<E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        supplier: impl FnOnce() -> Result<String, E>,
    ) -> Result<String, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = supplier()?;
        self.put(key, value.as_str(), ttl);
        Ok(value)
    }

    pub fn flush(&self) {
        if let Some(cache) = &self.inner {
            cache.invalidate_all();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.as_ref().map_or(0, |c| {
                c.run_pending_tasks();
                c.entry_count()
            }),
        }
    }
}

/// Lookup counters since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lookups() == 0 {
            return write!(f, "no lookups");
        }
        write!(
            f,
            "{} hits, {} misses ({} lookups, {} entries)",
            self.hits,
            self.misses,
            self.lookups(),
            self.entries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> ResultCache {
        ResultCache::new(&CacheConfig::default())
    }

    // =========================================================================
    // Enabled cache
    // =========================================================================

    #[test]
    fn put_then_get() {
        let cache = enabled();
        cache.put("k", "v", None);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("other"), None);
    }

    #[test]
    fn forget_removes_entry() {
        let cache = enabled();
        cache.put("k", "v", None);
        cache.forget("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn flush_removes_everything() {
        let cache = enabled();
        cache.put("a", "1", None);
        cache.put("b", "2", None);
        cache.flush();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn entry_expires_after_its_ttl() {
        let cache = enabled();
        cache.put("short", "v", Some(Duration::from_millis(30)));
        cache.put("long", "v", None);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long").as_deref(), Some("v"));
    }

    #[test]
    fn keys_carry_configured_prefix() {
        let cache = ResultCache::new(&CacheConfig {
            prefix: "site1_".into(),
            ..CacheConfig::default()
        });
        assert_eq!(cache.full_key("metadata:x"), "site1_metadata:x");
        cache.put("k", "v", None);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn remember_calls_supplier_once() {
        let cache = enabled();
        let mut calls = 0;
        let first: Result<String, ()> = cache.remember("k", None, || {
            calls += 1;
            Ok("computed".into())
        });
        let second: Result<String, ()> = cache.remember("k", None, || {
            calls += 1;
            Ok("again".into())
        });
        assert_eq!(first.unwrap(), "computed");
        assert_eq!(second.unwrap(), "computed");
        assert_eq!(calls, 1);
    }

    #[test]
    fn remember_does_not_store_errors() {
        let cache = enabled();
        let failed: Result<String, &str> = cache.remember("k", None, || Err("boom"));
        assert_eq!(failed, Err("boom"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = enabled();
        cache.put("k", "v", None);
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (2, 1, 1));
    }

    // =========================================================================
    // Disabled cache
    // =========================================================================

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResultCache::disabled();
        assert!(!cache.is_enabled());
        cache.put("k", "v", None);
        assert_eq!(cache.get("k"), None);
        cache.forget("k");
        cache.flush();
    }

    #[test]
    fn disabled_remember_always_calls_supplier() {
        let cache = ResultCache::disabled();
        let mut calls = 0;
        for _ in 0..2 {
            let _: Result<String, ()> = cache.remember("k", None, || {
                calls += 1;
                Ok("v".into())
            });
        }
        assert_eq!(calls, 2);
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display() {
        let s = CacheStats {
            hits: 5,
            misses: 2,
            entries: 3,
        };
        assert_eq!(s.to_string(), "5 hits, 2 misses (7 lookups, 3 entries)");
        assert_eq!(CacheStats::default().to_string(), "no lookups");
    }

    #[test]
    fn metadata_key_format() {
        let hash = ContentHash::of(b"x");
        assert_eq!(metadata_key(&hash), format!("metadata:{}", hash.as_str()));
    }
}
