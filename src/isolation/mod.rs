//! Workload isolation
//!
//! Decides which pool serves each operation. Writes always go to the
//! current primary. Normal reads are spread over replicas by the
//! [`LoadBalancer`], critical reads use a reserved priority pool on the
//! primary, and reads that would land on a lagging replica are rerouted to
//! the primary.
//!
//! The [`Topology`] holds the current primary pointer. Failover swaps it
//! atomically, so routing never observes a half-finished promotion.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ResilienceError;
use crate::lb::{Endpoint, LoadBalancer, Role, Selection};
use crate::store::{Priority, Query, QueryKind, Target, TargetId};

/// Primary pointer plus every configured endpoint
pub struct Topology {
    endpoints: Vec<Arc<Endpoint>>,
    primary: ArcSwap<Endpoint>,
}

impl Topology {
    pub fn new(primary: Target, replicas: Vec<Target>) -> Self {
        let primary = Arc::new(Endpoint::new(primary, Role::Primary));
        let mut endpoints = vec![Arc::clone(&primary)];
        endpoints.extend(
            replicas
                .into_iter()
                .map(|target| Arc::new(Endpoint::new(target, Role::Replica))),
        );

        Self {
            endpoints,
            primary: ArcSwap::from(primary),
        }
    }

    /// Endpoint currently accepting writes
    pub fn primary(&self) -> Arc<Endpoint> {
        self.primary.load_full()
    }

    pub fn primary_id(&self) -> TargetId {
        self.primary.load().id().clone()
    }

    /// All endpoints, in configuration order (configured primary first)
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, id: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.id() == id)
    }

    /// Endpoints currently in the replica role
    pub fn replicas(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.iter().filter(|e| e.role() == Role::Replica)
    }

    /// Make `candidate` the primary and retire the old one
    ///
    /// Returns the old primary. Callers serialize promotions.
    pub fn promote(&self, candidate: &Arc<Endpoint>) -> Arc<Endpoint> {
        let old = self.primary.load_full();
        candidate.set_role(Role::Primary);
        self.primary.store(Arc::clone(candidate));
        if !Arc::ptr_eq(&old, candidate) {
            old.set_role(Role::Retired);
        }
        info!(old_primary = %old.id(), new_primary = %candidate.id(), "Primary pointer moved");
        old
    }
}

/// Which kind of pool a route draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Primary,
    Replica,
    Priority,
}

/// Routing decision for one operation
#[derive(Debug, Clone)]
pub struct Route {
    pub target: Target,
    pub lane: Lane,
    /// Replica chosen by the balancer, when the route is a replica read
    pub endpoint: Option<Arc<Endpoint>>,
    /// A read that wanted a replica but is served by the primary
    pub degraded: bool,
}

impl Route {
    fn primary(topology: &Topology, lane: Lane, degraded: bool) -> Self {
        Self {
            target: topology.primary().target().clone(),
            lane,
            endpoint: None,
            degraded,
        }
    }
}

/// Routing counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct IsolationStats {
    pub writes: u64,
    pub replica_reads: u64,
    pub priority_reads: u64,
    pub lag_reroutes: u64,
    pub fallback_reads: u64,
}

#[derive(Default)]
struct AtomicIsolationStats {
    writes: AtomicU64,
    replica_reads: AtomicU64,
    priority_reads: AtomicU64,
    lag_reroutes: AtomicU64,
    fallback_reads: AtomicU64,
}

/// Routes operations to the primary, a replica or the priority pool
pub struct WorkloadIsolator {
    topology: Arc<Topology>,
    balancer: Arc<LoadBalancer>,
    lag_threshold: Duration,
    stats: AtomicIsolationStats,
}

impl WorkloadIsolator {
    pub fn new(topology: Arc<Topology>, balancer: Arc<LoadBalancer>, lag_threshold: Duration) -> Self {
        Self {
            topology,
            balancer,
            lag_threshold,
            stats: AtomicIsolationStats::default(),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn route(&self, query: &Query) -> Route {
        match query.kind {
            QueryKind::Write => self.route_write(),
            QueryKind::Read => self.route_read(query.priority),
        }
    }

    pub fn route_write(&self) -> Route {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Route::primary(&self.topology, Lane::Primary, false)
    }

    pub fn route_read(&self, priority: Priority) -> Route {
        if priority == Priority::Critical {
            self.stats.priority_reads.fetch_add(1, Ordering::Relaxed);
            return Route::primary(&self.topology, Lane::Priority, false);
        }

        let endpoint = match self.balancer.select_replica() {
            Selection::Replica(endpoint) => endpoint,
            Selection::PrimaryFallback => {
                self.stats.fallback_reads.fetch_add(1, Ordering::Relaxed);
                return Route::primary(&self.topology, Lane::Primary, true);
            }
        };

        let lag = endpoint.replication_lag();
        if endpoint.is_lagging() || lag > self.lag_threshold {
            self.stats.lag_reroutes.fetch_add(1, Ordering::Relaxed);
            let reason = ResilienceError::ReplicaLagExceeded {
                target: endpoint.id().clone(),
                lag,
            };
            debug!(reason = %reason, "Rerouting read to primary");
            return Route::primary(&self.topology, Lane::Primary, true);
        }

        self.stats.replica_reads.fetch_add(1, Ordering::Relaxed);
        Route {
            target: endpoint.target().clone(),
            lane: Lane::Replica,
            endpoint: Some(endpoint),
            degraded: false,
        }
    }

    /// Degraded primary route for a replica read that could not get a
    /// connection on its replica
    pub fn fallback_route(&self) -> Route {
        self.stats.fallback_reads.fetch_add(1, Ordering::Relaxed);
        Route::primary(&self.topology, Lane::Primary, true)
    }

    pub fn stats(&self) -> IsolationStats {
        IsolationStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            replica_reads: self.stats.replica_reads.load(Ordering::Relaxed),
            priority_reads: self.stats.priority_reads.load(Ordering::Relaxed),
            lag_reroutes: self.stats.lag_reroutes.load(Ordering::Relaxed),
            fallback_reads: self.stats.fallback_reads.load(Ordering::Relaxed),
        }
    }
}
