//! Pools for every target plus the reserved priority pool
//!
//! Each target (the primary and every replica) owns a [`TargetPool`] gated
//! by its own [`CircuitBreaker`]. Critical reads draw from a small priority
//! pool on the current primary that shares the primary's breaker but never
//! its capacity. The priority pool is rebuilt when failover moves the
//! primary.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use super::connection::{PoolConfig, PoolError, PoolStats, PooledConnection, TargetPool};
use crate::events::EventBus;
use crate::isolation::{Lane, Route, WorkloadIsolator};
use crate::store::{DataStore, Priority, Query, TargetId};

/// A checked-out connection together with the route that produced it
///
/// Tracks the replica's active-connection count for the balancer.
#[derive(Debug)]
pub struct RoutedConnection {
    conn: PooledConnection,
    route: Route,
}

impl RoutedConnection {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Return the connection to its pool
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for RoutedConnection {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RoutedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for RoutedConnection {
    fn drop(&mut self) {
        if let Some(endpoint) = &self.route.endpoint {
            endpoint.decrement_connections();
        }
    }
}

/// Serializable breaker summary
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub target: TargetId,
    pub state: String,
    pub total_requests: u64,
    pub total_rejected: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub window_failure_rate: f64,
    pub window_samples: usize,
    pub open_count: u64,
    pub time_in_state_ms: u64,
}

impl BreakerStats {
    fn from_stats(target: &TargetId, stats: CircuitStats) -> Self {
        Self {
            target: target.clone(),
            state: stats.state.name().to_string(),
            total_requests: stats.total_requests,
            total_rejected: stats.total_rejected,
            total_successes: stats.total_successes,
            total_failures: stats.total_failures,
            window_failure_rate: stats.window_failure_rate,
            window_samples: stats.window_samples,
            open_count: stats.open_count,
            time_in_state_ms: stats.time_in_state.as_millis() as u64,
        }
    }
}

/// Aggregate statistics across all pools
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub primary: TargetId,
    pub pools: Vec<PoolStats>,
    pub priority: PoolStats,
    pub breakers: Vec<BreakerStats>,
}

/// Owns every pool and routes acquires to the right one
pub struct ConnectionPoolManager {
    store: Arc<dyn DataStore>,
    isolator: Arc<WorkloadIsolator>,
    pools: HashMap<TargetId, Arc<TargetPool>>,
    /// Configuration order, for stable stats output
    order: Vec<TargetId>,
    priority: ArcSwap<TargetPool>,
    config: PoolConfig,
    priority_size: usize,
    events: EventBus,
}

impl ConnectionPoolManager {
    pub fn new(
        store: Arc<dyn DataStore>,
        isolator: Arc<WorkloadIsolator>,
        config: PoolConfig,
        breaker_config: CircuitBreakerConfig,
        priority_size: usize,
        events: EventBus,
    ) -> Self {
        let mut pools = HashMap::new();
        let mut order = Vec::new();
        for endpoint in isolator.topology().endpoints() {
            let target = endpoint.target().clone();
            let breaker = Arc::new(
                CircuitBreaker::new(target.id.clone(), breaker_config.clone())
                    .with_events(events.clone()),
            );
            let pool = TargetPool::new(
                target.id.clone(),
                target.clone(),
                Arc::clone(&store),
                breaker,
                config.clone(),
                events.clone(),
            );
            order.push(target.id.clone());
            pools.insert(target.id, pool);
        }

        let primary_id = isolator.topology().primary_id();
        let priority = Self::build_priority(&store, &pools[&primary_id], &config, priority_size, &events);

        Self {
            store,
            isolator,
            pools,
            order,
            priority: ArcSwap::from(priority),
            config,
            priority_size,
            events,
        }
    }

    fn build_priority(
        store: &Arc<dyn DataStore>,
        base: &Arc<TargetPool>,
        config: &PoolConfig,
        size: usize,
        events: &EventBus,
    ) -> Arc<TargetPool> {
        let size = size.max(1);
        let priority_config = PoolConfig {
            max_connections: size,
            min_connections: size.min(config.min_connections),
            ..config.clone()
        };
        TargetPool::new(
            format!("{}-priority", base.target().id),
            base.target().clone(),
            Arc::clone(store),
            Arc::clone(base.breaker()),
            priority_config,
            events.clone(),
        )
    }

    pub fn isolator(&self) -> &Arc<WorkloadIsolator> {
        &self.isolator
    }

    /// Pool for a target
    pub fn pool(&self, target: &str) -> Result<&Arc<TargetPool>, PoolError> {
        self.pools
            .get(target)
            .ok_or_else(|| PoolError::UnknownTarget(target.to_string()))
    }

    pub fn primary_pool(&self) -> Result<&Arc<TargetPool>, PoolError> {
        self.pool(&self.isolator.topology().primary_id())
    }

    pub fn priority_pool(&self) -> Arc<TargetPool> {
        self.priority.load_full()
    }

    pub fn breaker(&self, target: &str) -> Result<&Arc<CircuitBreaker>, PoolError> {
        self.pool(target).map(|pool| pool.breaker())
    }

    /// Check out a connection to the current primary
    pub async fn acquire_write(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoutedConnection, PoolError> {
        let route = self.isolator.route_write();
        self.acquire_route(route, cancel, deadline).await
    }

    /// Check out a connection for a read
    pub async fn acquire_read(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoutedConnection, PoolError> {
        let route = self.isolator.route_read(priority);
        self.acquire_with_fallback(route, cancel, deadline).await
    }

    /// Check out a connection for a query, routed by its kind
    ///
    /// Write-typed queries always land on the primary pool whatever their
    /// priority.
    pub async fn acquire_for(
        &self,
        query: &Query,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoutedConnection, PoolError> {
        let route = self.isolator.route(query);
        self.acquire_with_fallback(route, cancel, deadline).await
    }

    /// A replica that cannot hand out a connection (open circuit, failed
    /// connect, exhausted pool) is skipped and the read is served by the
    /// primary instead.
    async fn acquire_with_fallback(
        &self,
        route: Route,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoutedConnection, PoolError> {
        if route.lane != Lane::Replica {
            return self.acquire_route(route, cancel, deadline).await;
        }

        let replica = route.target.id.clone();
        match self.acquire_route(route, cancel, deadline).await {
            Ok(conn) => Ok(conn),
            Err(e) if Self::replica_unavailable(&e) => {
                warn!(replica = %replica, error = %e, "Replica unavailable, reading from primary");
                let fallback = self.isolator.fallback_route();
                self.acquire_route(fallback, cancel, deadline).await
            }
            Err(e) => Err(e),
        }
    }

    fn replica_unavailable(err: &PoolError) -> bool {
        matches!(
            err,
            PoolError::Circuit(_)
                | PoolError::ConnectionFailed { .. }
                | PoolError::PoolExhausted { .. }
                | PoolError::Closed(_)
        )
    }

    /// Check out a connection from the pool a route names
    pub async fn acquire_route(
        &self,
        route: Route,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoutedConnection, PoolError> {
        let pool = match route.lane {
            Lane::Priority => self.priority_pool(),
            Lane::Primary | Lane::Replica => Arc::clone(self.pool(&route.target.id)?),
        };

        let conn = pool.acquire(cancel, deadline).await?;
        if let Some(endpoint) = &route.endpoint {
            endpoint.increment_connections();
        }
        Ok(RoutedConnection { conn, route })
    }

    /// Return a connection to its pool
    pub fn release(&self, conn: RoutedConnection) {
        conn.release();
    }

    /// Pre-warm every pool to its minimum
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        for id in &self.order {
            opened += self.pools[id].warm_up().await;
        }
        opened += self.priority_pool().warm_up().await;
        info!(opened = opened, pools = self.pools.len() + 1, "Connection pools warmed up");
        opened
    }

    /// Spawn reaper tasks for every pool, including whichever priority pool
    /// is current on each tick
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .order
            .iter()
            .map(|id| self.pools[id].spawn_maintenance(shutdown.clone()))
            .collect();

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.priority_pool().maintain().await,
                }
            }
            debug!("Priority pool maintenance stopped");
        }));
        handles
    }

    /// Point the priority pool at a new primary
    ///
    /// The old pool is shut down; connections still checked out from it are
    /// closed when their guards drop.
    pub async fn rebuild_priority(&self, new_primary: &str) -> Result<(), PoolError> {
        let base = self.pool(new_primary)?;
        let fresh = Self::build_priority(&self.store, base, &self.config, self.priority_size, &self.events);
        let old = self.priority.swap(Arc::clone(&fresh));
        old.shutdown().await;

        tokio::spawn(async move {
            fresh.warm_up().await;
        });
        info!(primary = %new_primary, size = self.priority_size, "Priority pool rebuilt");
        Ok(())
    }

    /// Close idle connections everywhere and reject new acquires
    pub async fn shutdown(&self) {
        for id in &self.order {
            self.pools[id].shutdown().await;
        }
        self.priority_pool().shutdown().await;
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            primary: self.isolator.topology().primary_id(),
            pools: self.order.iter().map(|id| self.pools[id].stats()).collect(),
            priority: self.priority_pool().stats(),
            breakers: self
                .order
                .iter()
                .map(|id| BreakerStats::from_stats(id, self.pools[id].breaker().stats()))
                .collect(),
        }
    }

    /// Default bounded wait, exposed for callers computing deadlines
    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }
}
