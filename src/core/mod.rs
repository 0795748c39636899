//! The resilience pool: one context object owning every component
//!
//! A [`ResiliencePool`] is built once from a [`Config`] plus the caller's
//! store and cache implementations, then shared (it is cheap to clone).
//! Every request-scoped call takes a [`RequestContext`] carrying the caller
//! identity, a cancellation token and an optional deadline.

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheStats, SetOptions};
use crate::config::Config;
use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use crate::isolation::{IsolationStats, Lane, Topology, WorkloadIsolator};
use crate::lb::{HealthMonitor, HealthStats, LoadBalancer};
use crate::pool::{ConnectionPoolManager, ManagerStats, RoutedConnection};
use crate::ratelimit::{RateLimitStats, RateLimiter};
use crate::store::{
    DataStore, DistributedCache, Invalidation, Query, QueryKind, Rows, StoreError, WriteOutcome,
};

/// Per-request identity, cancellation and deadline
#[derive(Debug, Clone)]
pub struct RequestContext {
    identity: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tie the request to an existing token, e.g. a child of a server-wide one
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `fut` unless the request is cancelled or its deadline passes first
    async fn race<F: Future>(&self, fut: F) -> Result<F::Output, ResilienceError> {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ResilienceError::Cancelled),
            _ = expired => Err(ResilienceError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

/// Aggregate statistics across all components
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStats {
    pub pools: ManagerStats,
    pub health: HealthStats,
    pub isolation: IsolationStats,
    pub cache: CacheStats,
    pub rate_limit: RateLimitStats,
    pub balancer_fallbacks: u64,
}

/// Shared context owning pools, breakers, health monitor, balancer,
/// isolator, cache and rate limiter
///
/// Clones share the same components.
#[derive(Clone)]
pub struct ResiliencePool {
    pub config: Arc<Config>,
    pub pools: Arc<ConnectionPoolManager>,
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<CacheManager>,
    pub rate_limiter: Arc<RateLimiter>,
    events: EventBus,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ResiliencePool {
    /// Build every component from configuration
    ///
    /// Nothing touches the store until [`ResiliencePool::start`].
    pub fn new(
        config: Config,
        store: Arc<dyn DataStore>,
        l2: Option<Arc<dyn DistributedCache>>,
    ) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let config = Arc::new(config);
        let events = EventBus::new(config.events.capacity);

        let (primary, replicas) = config.targets();
        let topology = Arc::new(Topology::new(primary, replicas));

        let balancer = Arc::new(LoadBalancer::new(
            topology.endpoints().to_vec(),
            config.load_balancer.to_balancer_config(),
        ));

        let isolator = Arc::new(WorkloadIsolator::new(
            topology,
            balancer,
            config.health.lag_threshold(),
        ));

        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&store),
            isolator,
            config.pool.to_pool_config(),
            config.circuit_breaker.to_breaker_config(),
            config.pool.priority_pool_size,
            events.clone(),
        ));

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&pools),
            store,
            config.health.to_health_config(),
            events.clone(),
        ));

        let cache = Arc::new(CacheManager::new(
            config.cache.to_cache_config(),
            l2,
            events.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.to_rate_limit_config(),
            events.clone(),
        ));

        info!(
            primary = %config.primary.id,
            replicas = config.replicas.len(),
            strategy = ?config.load_balancer.strategy,
            "Resilience pool created"
        );

        Ok(Self {
            config,
            pools,
            health,
            cache,
            rate_limiter,
            events,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Pre-warm pools and start background tasks (reapers, health probes,
    /// L1 expiry sweep)
    ///
    /// Returns the number of connections opened while warming up.
    pub async fn start(&self) -> usize {
        let opened = self.pools.warm_up().await;

        let mut handles = self.pools.spawn_maintenance(self.shutdown.clone());
        handles.extend(self.health.start(self.shutdown.clone()));
        handles.push(self.spawn_cache_sweep());

        let count = handles.len();
        self.tasks.lock().extend(handles);
        info!(connections = opened, tasks = count, "Resilience pool started");
        opened
    }

    fn spawn_cache_sweep(&self) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let shutdown = self.shutdown.clone();
        let period = cache.config().l1_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged = purged, "Expired L1 entries purged");
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and close every pool
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pools.shutdown().await;
        info!("Resilience pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn isolator(&self) -> &Arc<WorkloadIsolator> {
        self.pools.isolator()
    }

    /// Admission control for one request
    pub async fn admit(&self, ctx: &RequestContext) -> Result<(), ResilienceError> {
        ctx.race(self.rate_limiter.check(ctx.identity())).await?
    }

    /// Run a read through admission, routing and the pool
    pub async fn read(&self, ctx: &RequestContext, query: &Query) -> Result<Rows, ResilienceError> {
        expect_kind(query, QueryKind::Read)?;
        self.admit(ctx).await?;
        self.execute_read(ctx, query).await
    }

    /// Read through the cache
    ///
    /// On a miss the query runs against the store and its rows, decoded as
    /// `T`, are cached under `key`. An entry that no longer decodes as `T`
    /// is dropped and treated as a miss.
    pub async fn cached_read<T>(
        &self,
        ctx: &RequestContext,
        key: &str,
        query: &Query,
        options: SetOptions,
    ) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
    {
        expect_kind(query, QueryKind::Read)?;
        self.admit(ctx).await?;

        if let Some(raw) = ctx.race(self.cache.get(key)).await? {
            match serde_json::from_slice::<T>(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached value does not decode, refetching");
                    self.cache.invalidate(key).await;
                }
            }
        }

        let rows = self.execute_read(ctx, query).await?;
        let value: T = serde_json::from_value(serde_json::Value::Array(rows))?;
        let encoded = Bytes::from(serde_json::to_vec(&value)?);
        ctx.race(self.cache.set(key, encoded, options)).await?;
        Ok(value)
    }

    /// Run a write on the primary, then drop the cache entries it names
    ///
    /// Invalidation happens only after the write has committed.
    pub async fn write(&self, ctx: &RequestContext, query: &Query) -> Result<WriteOutcome, ResilienceError> {
        expect_kind(query, QueryKind::Write)?;
        self.admit(ctx).await?;

        let mut conn = self
            .pools
            .acquire_for(query, ctx.cancel_token(), ctx.deadline())
            .await?;
        let outcome = ctx.race(conn.execute_write(query)).await;
        let written = settle(&mut conn, outcome)?;
        drop(conn);

        if !query.invalidates.is_empty() {
            let dropped = self.cache.apply(&query.invalidates).await;
            debug!(invalidations = query.invalidates.len(), keys = dropped, "Write invalidated cache");
        }
        Ok(written)
    }

    /// Drop cache entries outside of a write
    pub async fn invalidate(&self, invalidations: &[Invalidation]) -> usize {
        self.cache.apply(invalidations).await
    }

    /// Run a read without admission control
    ///
    /// A replica that loses its connection mid-query is retried once on
    /// the primary.
    async fn execute_read(&self, ctx: &RequestContext, query: &Query) -> Result<Rows, ResilienceError> {
        let mut conn = self
            .pools
            .acquire_for(query, ctx.cancel_token(), ctx.deadline())
            .await?;
        let lane = conn.route().lane;
        let outcome = ctx.race(conn.execute_read(query)).await;

        match settle(&mut conn, outcome) {
            Err(ResilienceError::Store(e)) if lane == Lane::Replica && e.is_connection_error() => {
                let replica = conn.target().id.clone();
                drop(conn);
                warn!(replica = %replica, error = %e, "Replica failed mid-read, retrying on primary");

                let fallback = self.isolator().fallback_route();
                let mut conn = self
                    .pools
                    .acquire_route(fallback, ctx.cancel_token(), ctx.deadline())
                    .await?;
                let outcome = ctx.race(conn.execute_read(query)).await;
                settle(&mut conn, outcome)
            }
            result => result,
        }
    }

    pub fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            pools: self.pools.stats(),
            health: self.health.stats(),
            isolation: self.isolator().stats(),
            cache: self.cache.stats(),
            rate_limit: self.rate_limiter.stats(),
            balancer_fallbacks: self.isolator().balancer().fallback_count(),
        }
    }
}

/// Reject a query handed to the wrong entry point, before it is admitted
/// or routed
fn expect_kind(query: &Query, expected: QueryKind) -> Result<(), ResilienceError> {
    if query.kind == expected {
        Ok(())
    } else {
        Err(ResilienceError::QueryKindMismatch {
            expected,
            actual: query.kind,
        })
    }
}

/// Feed a query outcome back into the target's breaker
///
/// Connection-level failures discard the connection and count against the
/// breaker. Query errors leave the connection usable. A query abandoned by
/// cancellation leaves the connection in an unknown state, so it is
/// discarded without blaming the target.
fn settle<T>(
    conn: &mut RoutedConnection,
    outcome: Result<Result<T, StoreError>, ResilienceError>,
) -> Result<T, ResilienceError> {
    match outcome {
        Ok(Ok(value)) => {
            conn.report_success();
            Ok(value)
        }
        Ok(Err(e)) if e.is_connection_error() => {
            conn.report_failure();
            Err(e.into())
        }
        Ok(Err(e)) => {
            conn.report_success();
            Err(e.into())
        }
        Err(e) => {
            conn.mark_broken();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::store::memory::{MemoryCache, MemoryStore};
    use crate::store::Priority;
    use serde_json::json;

    fn config(replicas: usize) -> Config {
        let mut config = Config::new(
            TargetConfig {
                id: "primary".to_string(),
                url: "mem://primary".to_string(),
            },
            (1..=replicas)
                .map(|i| TargetConfig {
                    id: format!("replica-{}", i),
                    url: format!("mem://replica-{}", i),
                })
                .collect(),
        );
        config.pool.max_connections = 4;
        config.pool.min_connections = 1;
        config.pool.priority_pool_size = 1;
        config.health.enabled = false;
        config
    }

    fn pool_with(config: Config) -> (ResiliencePool, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let l2 = Arc::new(MemoryCache::new());
        let pool = ResiliencePool::new(
            config,
            Arc::clone(&store) as Arc<dyn DataStore>,
            Some(Arc::clone(&l2) as Arc<dyn DistributedCache>),
        )
        .unwrap();
        (pool, store, l2)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = config(1);
        config.pool.min_connections = 10;
        let err = ResiliencePool::new(config, Arc::new(MemoryStore::new()), None).err().unwrap();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[tokio::test]
    async fn test_reads_go_to_replicas_and_writes_to_primary() {
        let (pool, store, _) = pool_with(config(1));
        let ctx = RequestContext::new("app");

        pool.read(&ctx, &Query::read("SELECT 1")).await.unwrap();
        pool.write(&ctx, &Query::write("UPDATE t SET x = 1")).await.unwrap();

        assert_eq!(store.target("replica-1").reads_served(), 1);
        assert_eq!(store.target("primary").writes_served(), 1);
        assert_eq!(pool.stats().isolation.writes, 1);
    }

    #[tokio::test]
    async fn test_write_query_never_reaches_replica() {
        let (pool, store, _) = pool_with(config(1));
        let ctx = RequestContext::new("app");
        let update = Query::write("UPDATE users SET x = 1");

        let err = pool.read(&ctx, &update).await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::QueryKindMismatch {
                expected: QueryKind::Read,
                actual: QueryKind::Write,
            }
        ));
        let err = pool
            .cached_read::<Vec<serde_json::Value>>(&ctx, "k", &update, SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::QueryKindMismatch { .. }));
        let err = pool.write(&ctx, &Query::read("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::QueryKindMismatch { .. }));

        let replica = store.target("replica-1");
        assert_eq!(replica.reads_served() + replica.writes_served(), 0);
        assert_eq!(store.target("primary").writes_served(), 0);
        assert_eq!(pool.stats().rate_limit.allowed, 0);
    }

    #[tokio::test]
    async fn test_critical_reads_use_priority_lane() {
        let (pool, store, _) = pool_with(config(1));
        let ctx = RequestContext::new("app");

        let query = Query::read("SELECT balance").with_priority(Priority::Critical);
        pool.read(&ctx, &query).await.unwrap();

        assert_eq!(store.target("primary").reads_served(), 1);
        assert_eq!(pool.stats().isolation.priority_reads, 1);
    }

    #[tokio::test]
    async fn test_cached_read_hits_after_first_fetch() {
        let (pool, store, _) = pool_with(config(1));
        let ctx = RequestContext::new("app");
        let query = Query::read("SELECT * FROM users");

        let first: Vec<serde_json::Value> = pool
            .cached_read(&ctx, "users:all", &query, SetOptions::default())
            .await
            .unwrap();
        let second: Vec<serde_json::Value> = pool
            .cached_read(&ctx, "users:all", &query, SetOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.target("replica-1").reads_served(), 1);
        assert_eq!(pool.stats().cache.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_write_invalidates_after_commit() {
        let (pool, _, l2) = pool_with(config(0));
        let ctx = RequestContext::new("app");

        pool.cache
            .set("user:1", Bytes::from_static(b"[]"), SetOptions::default().tag("users"))
            .await;
        assert!(l2.contains("user:1"));

        let write = Query::write("UPDATE users SET name = 'x'")
            .invalidating(Invalidation::Tag("users".to_string()));
        pool.write(&ctx, &write).await.unwrap();

        assert!(pool.cache.get("user:1").await.is_none());
        assert!(!l2.contains("user:1"));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let (pool, store, _) = pool_with(config(0));
        let ctx = RequestContext::new("app");
        pool.cache
            .set("user:1", Bytes::from_static(b"[]"), SetOptions::default().tag("users"))
            .await;

        store.target("primary").set_read_only(true);
        let write = Query::write("UPDATE users SET name = 'x'")
            .invalidating(Invalidation::Tag("users".to_string()));
        assert!(pool.write(&ctx, &write).await.is_err());
        assert!(pool.cache.get("user:1").await.is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_applies_before_routing() {
        let mut config = config(1);
        config.rate_limit.per_identity_limit = 2;
        let (pool, store, _) = pool_with(config);
        let ctx = RequestContext::new("tenant-a");
        let query = Query::read("SELECT 1");

        pool.read(&ctx, &query).await.unwrap();
        pool.read(&ctx, &query).await.unwrap();
        let err = pool.read(&ctx, &query).await.unwrap_err();

        assert!(matches!(err, ResilienceError::RateLimited { .. }));
        assert!(err.retry_after().is_some());
        assert_eq!(store.target("replica-1").reads_served(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_request_fails_fast() {
        let (pool, _, _) = pool_with(config(1));
        let ctx = RequestContext::new("app");
        ctx.cancel();

        let err = pool.read(&ctx, &Query::read("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_slow_query() {
        let (pool, store, _) = pool_with(config(0));
        store.target("primary").set_query_delay(Duration::from_secs(10));
        let ctx = RequestContext::new("app").with_timeout(Duration::from_secs(1));

        let err = pool.read(&ctx, &Query::read("SELECT pg_sleep(10)")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded));

        // The abandoned connection is discarded, not leaked
        let primary = &pool.stats().pools.pools[0];
        assert_eq!(primary.active_connections, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (pool, _, _) = pool_with(config(1));
        let opened = pool.start().await;
        assert!(opened >= 2);

        pool.shutdown().await;
        assert!(pool.is_shut_down());

        let ctx = RequestContext::new("app");
        let err = pool.write(&ctx, &Query::write("INSERT 1")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::PoolClosed(_)));
    }
}
