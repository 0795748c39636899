//! Two-tier cache behaviour through the request API
//!
//! Two pools sharing one store and one distributed cache stand in for two
//! application instances.

use dbpool::cache::SetOptions;
use dbpool::config::{Config, TargetConfig};
use dbpool::store::memory::{MemoryCache, MemoryStore};
use dbpool::store::{DataStore, DistributedCache, Invalidation, Query};
use dbpool::{RequestContext, ResilienceEvent, ResiliencePool};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    let mut config = Config::new(
        TargetConfig {
            id: "primary".to_string(),
            url: "mem://primary".to_string(),
        },
        vec![TargetConfig {
            id: "replica-1".to_string(),
            url: "mem://replica-1".to_string(),
        }],
    );
    config.pool.min_connections = 0;
    config.pool.max_connections = 4;
    config.health.enabled = false;
    config
}

fn instance(store: &Arc<MemoryStore>, l2: &Arc<MemoryCache>) -> ResiliencePool {
    ResiliencePool::new(
        config(),
        Arc::clone(store) as Arc<dyn DataStore>,
        Some(Arc::clone(l2) as Arc<dyn DistributedCache>),
    )
    .unwrap()
}

fn user_query() -> Query {
    Query::read("SELECT * FROM users WHERE id = 1")
}

fn user_options() -> SetOptions {
    SetOptions::default().tag("users")
}

#[tokio::test]
async fn test_read_your_writes_across_tiers() {
    let store = Arc::new(MemoryStore::new());
    let l2 = Arc::new(MemoryCache::new());
    let a = instance(&store, &l2);
    let b = instance(&store, &l2);
    let ctx = RequestContext::new("app");
    let replica = store.target("replica-1");

    // A fills both tiers, B is served from L2
    let _: Vec<Value> = a.cached_read(&ctx, "user:1", &user_query(), user_options()).await.unwrap();
    assert_eq!(replica.reads_served(), 1);
    let _: Vec<Value> = b.cached_read(&ctx, "user:1", &user_query(), user_options()).await.unwrap();
    assert_eq!(replica.reads_served(), 1);
    assert_eq!(b.stats().cache.l2_hits, 1);

    // B writes; its next read must not see the old entry in either tier
    let write = Query::write("UPDATE users SET name = 'grace' WHERE id = 1")
        .invalidating(Invalidation::Tag("users".to_string()));
    b.write(&ctx, &write).await.unwrap();
    assert!(!l2.contains("user:1"));

    let _: Vec<Value> = b.cached_read(&ctx, "user:1", &user_query(), user_options()).await.unwrap();
    assert_eq!(replica.reads_served(), 2);
}

#[tokio::test]
async fn test_pattern_invalidation() {
    let store = Arc::new(MemoryStore::new());
    let l2 = Arc::new(MemoryCache::new());
    let pool = instance(&store, &l2);
    let ctx = RequestContext::new("app");

    for key in ["user:1:profile", "user:2:profile", "order:1"] {
        let _: Vec<Value> = pool
            .cached_read(&ctx, key, &Query::read(format!("SELECT '{}'", key)), SetOptions::default())
            .await
            .unwrap();
    }

    let dropped = pool
        .invalidate(&[Invalidation::Pattern("user:*:profile".to_string())])
        .await;
    assert_eq!(dropped, 2);
    assert!(!l2.contains("user:1:profile"));
    assert!(!l2.contains("user:2:profile"));
    assert!(l2.contains("order:1"));
    assert!(pool.cache.get("order:1").await.is_some());
}

#[tokio::test]
async fn test_distributed_cache_outage_is_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let l2 = Arc::new(MemoryCache::new());
    let pool = instance(&store, &l2);
    let mut events = pool.subscribe();
    let ctx = RequestContext::new("app");
    let replica = store.target("replica-1");

    let _: Vec<Value> = pool.cached_read(&ctx, "user:1", &user_query(), user_options()).await.unwrap();

    // The write commits even though L2 cannot be invalidated; the key is
    // tombstoned so the stale L2 copy is not served once L2 returns.
    l2.set_available(false);
    let write = Query::write("UPDATE users SET name = 'ada' WHERE id = 1")
        .invalidating(Invalidation::Key("user:1".to_string()));
    pool.write(&ctx, &write).await.unwrap();
    assert!(pool.stats().cache.tombstones >= 1);

    l2.set_available(true);
    assert!(l2.contains("user:1"));
    let _: Vec<Value> = pool.cached_read(&ctx, "user:1", &user_query(), user_options()).await.unwrap();
    assert_eq!(replica.reads_served(), 2);

    let mut unavailable = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ResilienceEvent::CacheUnavailable { .. }) {
            unavailable += 1;
        }
    }
    assert_eq!(unavailable, 1);
}

#[tokio::test(start_paused = true)]
async fn test_l1_entries_expire() {
    let store = Arc::new(MemoryStore::new());
    let l2 = Arc::new(MemoryCache::new());
    let pool = instance(&store, &l2);
    let ctx = RequestContext::new("app");
    let options = SetOptions::default().ttl(Duration::from_secs(5));

    let _: Vec<Value> = pool.cached_read(&ctx, "k", &user_query(), options.clone()).await.unwrap();
    assert_eq!(l2.ttl_of("k"), Some(Duration::from_secs(5)));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(pool.cache.get("k").await.is_none());
    assert_eq!(pool.cache.purge_expired(), 0);
}
