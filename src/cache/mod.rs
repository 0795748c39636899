//! Two-tier cache
//!
//! L1 is a process-local LRU ([`LruStore`]) behind a single mutex, L2 a
//! [`DistributedCache`] shared across processes. Reads check L1 then L2 and
//! backfill L1 on an L2 hit. The L2 tier fails open: an unreachable cache
//! turns into misses and the caller falls through to the data store.
//!
//! When an invalidation cannot reach L2 the key is tombstoned locally for
//! `fallback_ttl`, so a stale L2 copy is not served or backfilled while the
//! remote entry is still alive.

mod lru;
mod pattern;

pub use lru::{CacheEntry, LruStore};
pub use pattern::GlobPattern;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventBus, ResilienceEvent};
use crate::store::{DistributedCache, Invalidation, StoreError};

/// Failures talking to the distributed tier
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Distributed cache unavailable: {0}")]
    Unavailable(#[source] StoreError),

    #[error("Distributed cache call timed out after {0:?}")]
    Timeout(Duration),
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum L1 entries
    pub l1_capacity: usize,
    /// Upper bound on the lifetime of an L1 entry
    pub l1_ttl: Duration,
    /// TTL used when the caller does not give one
    pub default_ttl: Duration,
    /// How long a key stays tombstoned after a failed invalidation
    pub fallback_ttl: Duration,
    /// Bound on every L2 call
    pub l2_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            l1_ttl: Duration::from_secs(60),
            default_ttl: Duration::from_secs(300),
            fallback_ttl: Duration::from_secs(30),
            l2_timeout: Duration::from_secs(1),
        }
    }
}

/// How a value should be written
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Lifetime in L2; L1 keeps the entry for at most `l1_ttl`
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Write-through to both tiers; otherwise L1 is best-effort
    pub critical: bool,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l1_entries: usize,
    pub l1_evictions: u64,
    /// Non-critical L1 writes skipped because the L1 lock was busy
    pub l1_skipped: u64,
    pub l2_errors: u64,
    pub invalidations: u64,
    pub tombstones: usize,
    pub l2_available: bool,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.l1_hits + self.l2_hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.l1_hits + self.l2_hits) as f64 / lookups as f64
    }
}

#[derive(Default)]
struct AtomicCacheStats {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l1_evictions: AtomicU64,
    l1_skipped: AtomicU64,
    l2_errors: AtomicU64,
    invalidations: AtomicU64,
}

/// L1 + L2 cache with tag and pattern invalidation
pub struct CacheManager {
    l1: Mutex<LruStore>,
    l2: Option<Arc<dyn DistributedCache>>,
    config: CacheConfig,
    tombstones: Mutex<HashMap<String, Instant>>,
    l2_down: AtomicBool,
    stats: AtomicCacheStats,
    events: EventBus,
}

impl CacheManager {
    pub fn new(config: CacheConfig, l2: Option<Arc<dyn DistributedCache>>, events: EventBus) -> Self {
        Self {
            l1: Mutex::new(LruStore::new(config.l1_capacity)),
            l2,
            config,
            tombstones: Mutex::new(HashMap::new()),
            l2_down: AtomicBool::new(false),
            stats: AtomicCacheStats::default(),
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a key up in L1, then L2
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if self.is_tombstoned(key) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(value) = self.l1.lock().get(key) {
            self.stats.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let value = match &self.l2 {
            Some(l2) => self.l2_call("get", l2.get(key)).await.ok().flatten(),
            None => None,
        };

        match value {
            // A failed invalidation may have raced this lookup.
            Some(hit) if !self.is_tombstoned(key) => {
                self.stats.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.insert_l1(key, hit.value.clone(), self.config.l1_ttl, &hit.tags);
                Some(hit.value)
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value
    ///
    /// Critical values are written through to both tiers. Otherwise L2 is
    /// written first and L1 only if its lock is free.
    pub async fn set(&self, key: &str, value: Bytes, options: SetOptions) {
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let l1_ttl = ttl.min(self.config.l1_ttl);

        if options.critical {
            self.insert_l1(key, value.clone(), l1_ttl, &options.tags);
        }

        let stored_remotely = match &self.l2 {
            Some(l2) => self
                .l2_call("set", l2.set(key, value.clone(), ttl, &options.tags))
                .await
                .is_ok(),
            None => false,
        };
        if stored_remotely {
            self.tombstones.lock().remove(key);
        }

        if !options.critical {
            match self.l1.try_lock() {
                Some(mut l1) => {
                    if l1.insert(key, value, l1_ttl, &options.tags).is_some() {
                        self.stats.l1_evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    self.stats.l1_skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "L1 busy, skipping best-effort write");
                }
            }
        }
    }

    /// Remove one key from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.l1.lock().remove(key);
        self.invalidate_remote(key).await;
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove every key carrying any of `tags`; returns how many keys were hit
    pub async fn invalidate_by_tag(&self, tags: &[String]) -> usize {
        let mut keys = BTreeSet::new();
        for tag in tags {
            keys.extend(self.l1.lock().keys_for_tag(tag));
            if let Some(l2) = &self.l2 {
                if let Ok(remote) = self.l2_call("scan_by_tag", l2.scan_by_tag(tag)).await {
                    keys.extend(remote);
                }
            }
        }
        self.invalidate_keys(keys).await
    }

    /// Remove every key matching a glob (`*`, `?`); returns how many keys were hit
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let glob = GlobPattern::new(pattern);
        let mut keys: BTreeSet<String> = self.l1.lock().keys_matching(&glob).into_iter().collect();
        if let Some(l2) = &self.l2 {
            if let Ok(remote) = self
                .l2_call("scan_by_pattern", l2.scan_by_pattern(pattern))
                .await
            {
                keys.extend(remote);
            }
        }
        self.invalidate_keys(keys).await
    }

    /// Apply the invalidations attached to a committed write
    pub async fn apply(&self, invalidations: &[Invalidation]) -> usize {
        let mut hit = 0;
        for invalidation in invalidations {
            hit += match invalidation {
                Invalidation::Key(key) => {
                    self.invalidate(key).await;
                    1
                }
                Invalidation::Tag(tag) => self.invalidate_by_tag(std::slice::from_ref(tag)).await,
                Invalidation::Pattern(pattern) => self.invalidate_by_pattern(pattern).await,
            };
        }
        hit
    }

    async fn invalidate_keys(&self, keys: BTreeSet<String>) -> usize {
        {
            let mut l1 = self.l1.lock();
            for key in &keys {
                l1.remove(key);
            }
        }
        for key in &keys {
            self.invalidate_remote(key).await;
        }
        self.stats
            .invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        keys.len()
    }

    async fn invalidate_remote(&self, key: &str) {
        let Some(l2) = &self.l2 else {
            return;
        };
        if self.l2_call("delete", l2.delete(key)).await.is_ok() {
            return;
        }

        let fallback = self.config.fallback_ttl;
        self.tombstones
            .lock()
            .insert(key.to_string(), Instant::now() + fallback);
        // Shorten the remote copy's life in case only the delete failed.
        let expired = self.l2_call("expire", l2.expire(key, fallback)).await.is_ok();
        warn!(
            key = %key,
            fallback_ttl_s = fallback.as_secs(),
            remote_expired = expired,
            "Cache invalidation failed, key tombstoned locally"
        );
    }

    fn is_tombstoned(&self, key: &str) -> bool {
        let mut tombstones = self.tombstones.lock();
        match tombstones.get(key) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                tombstones.remove(key);
                false
            }
            None => false,
        }
    }

    fn insert_l1(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String]) {
        if self.l1.lock().insert(key, value, ttl, tags).is_some() {
            self.stats.l1_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run one L2 call under the configured timeout, tracking availability
    async fn l2_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let error = match tokio::time::timeout(self.config.l2_timeout, call).await {
            Ok(Ok(value)) => {
                if self.l2_down.swap(false, Ordering::AcqRel) {
                    info!(operation = operation, "Distributed cache reachable again");
                }
                return Ok(value);
            }
            Ok(Err(e)) => CacheError::Unavailable(e),
            Err(_) => CacheError::Timeout(self.config.l2_timeout),
        };

        self.stats.l2_errors.fetch_add(1, Ordering::Relaxed);
        if !self.l2_down.swap(true, Ordering::AcqRel) {
            warn!(operation = operation, error = %error, "Distributed cache unavailable, failing open");
            self.events.publish(ResilienceEvent::CacheUnavailable {
                operation,
                error: error.to_string(),
            });
        } else {
            debug!(operation = operation, error = %error, "Distributed cache call failed");
        }
        Err(error)
    }

    /// Drop expired L1 entries and tombstones
    pub fn purge_expired(&self) -> usize {
        let purged = self.l1.lock().purge_expired();
        let now = Instant::now();
        self.tombstones.lock().retain(|_, until| now < *until);
        purged
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.stats.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.stats.l2_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            l1_entries: self.l1.lock().len(),
            l1_evictions: self.stats.l1_evictions.load(Ordering::Relaxed),
            l1_skipped: self.stats.l1_skipped.load(Ordering::Relaxed),
            l2_errors: self.stats.l2_errors.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            tombstones: self.tombstones.lock().len(),
            l2_available: !self.l2_down.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCache;

    fn manager() -> (CacheManager, Arc<MemoryCache>) {
        let l2 = Arc::new(MemoryCache::new());
        let cache = CacheManager::new(CacheConfig::default(), Some(l2.clone()), EventBus::default());
        (cache, l2)
    }

    fn value(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let (cache, l2) = manager();
        l2.set("k", value("v"), Duration::from_secs(60), &[]).await.unwrap();

        assert_eq!(cache.get("k").await, Some(value("v")));
        assert_eq!(cache.stats().l2_hits, 1);

        l2.set_available(false);
        assert_eq!(cache.get("k").await, Some(value("v")));
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn test_critical_set_writes_both_tiers() {
        let (cache, l2) = manager();
        cache.set("k", value("v"), SetOptions::default().critical()).await;

        assert!(l2.contains("k"));
        assert!(cache.l1.lock().contains("k"));
    }

    #[tokio::test]
    async fn test_l1_ttl_is_capped() {
        let (cache, l2) = manager();
        cache
            .set("k", value("v"), SetOptions::default().ttl(Duration::from_secs(600)))
            .await;

        assert_eq!(l2.ttl_of("k").map(|t| t > Duration::from_secs(590)), Some(true));
        let l1 = cache.l1.lock();
        assert!(l1.contains("k"));
    }

    #[tokio::test]
    async fn test_unavailable_l2_fails_open() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let l2 = Arc::new(MemoryCache::new());
        let cache = CacheManager::new(CacheConfig::default(), Some(l2.clone()), events);
        l2.set_available(false);

        assert_eq!(cache.get("missing").await, None);
        assert_eq!(cache.get("missing").await, None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.l2_errors, 2);
        assert!(!stats.l2_available);

        // One event per outage, not per call
        assert_eq!(rx.try_recv().unwrap().name(), "cache_unavailable");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_invalidation_tombstones_key() {
        let (cache, l2) = manager();
        cache.set("k", value("old"), SetOptions::default()).await;

        l2.set_available(false);
        cache.invalidate("k").await;
        l2.set_available(true);

        // L2 still holds the stale value, but it is not served
        assert!(l2.contains("k"));
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().tombstones, 1);

        // A fresh write clears the tombstone
        cache.set("k", value("new"), SetOptions::default()).await;
        assert_eq!(cache.get("k").await, Some(value("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_expires() {
        let (cache, l2) = manager();
        l2.set_available(false);
        cache.invalidate("k").await;
        assert!(cache.is_tombstoned("k"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.is_tombstoned("k"));
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_unions_tiers() {
        let (cache, l2) = manager();
        cache
            .set("user:1", value("a"), SetOptions::default().tag("users"))
            .await;
        // Written by another process: only L2 knows it
        l2.set("user:2", value("b"), Duration::from_secs(60), &["users".to_string()])
            .await
            .unwrap();

        let hit = cache.invalidate_by_tag(&["users".to_string()]).await;
        assert_eq!(hit, 2);
        assert!(!l2.contains("user:1"));
        assert!(!l2.contains("user:2"));
        assert_eq!(cache.get("user:1").await, None);
    }

    #[tokio::test]
    async fn test_tag_invalidation_during_outage_drops_backfilled_copy() {
        let (cache, l2) = manager();
        // Written by another process, then backfilled here from L2
        l2.set("user:1", value("old"), Duration::from_secs(60), &["users".to_string()])
            .await
            .unwrap();
        assert_eq!(cache.get("user:1").await, Some(value("old")));

        l2.set_available(false);
        assert_eq!(cache.invalidate_by_tag(&["users".to_string()]).await, 1);
        assert_eq!(cache.get("user:1").await, None);
        assert!(cache.is_tombstoned("user:1"));

        // The stale remote copy is not served once L2 is back
        l2.set_available(true);
        assert!(l2.contains("user:1"));
        assert_eq!(cache.get("user:1").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let (cache, l2) = manager();
        cache.set("user:1:profile", value("a"), SetOptions::default()).await;
        cache.set("user:2:profile", value("b"), SetOptions::default()).await;
        cache.set("order:1", value("c"), SetOptions::default()).await;

        assert_eq!(cache.invalidate_by_pattern("user:*:profile").await, 2);
        assert!(l2.contains("order:1"));
        assert_eq!(cache.get("order:1").await, Some(value("c")));
    }

    #[tokio::test]
    async fn test_apply_write_invalidations() {
        let (cache, _l2) = manager();
        cache.set("a", value("1"), SetOptions::default().tag("t")).await;
        cache.set("b", value("2"), SetOptions::default()).await;

        let hit = cache
            .apply(&[Invalidation::Tag("t".to_string()), Invalidation::Key("b".to_string())])
            .await;
        assert_eq!(hit, 2);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_without_l2() {
        let cache = CacheManager::new(CacheConfig::default(), None, EventBus::default());
        cache.set("k", value("v"), SetOptions::default()).await;
        assert_eq!(cache.get("k").await, Some(value("v")));
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
