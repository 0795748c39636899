//! A database target as seen by the balancer
//!
//! Health is published as an immutable snapshot swapped on every probe, so
//! the request path reads it without locking.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::store::{ProbeReport, Target, TargetId};

/// Role a target currently plays in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepts writes
    Primary,
    /// Serves reads
    Replica,
    /// A former primary that failed over; excluded from routing until an
    /// operator re-attaches it
    Retired,
}

impl Role {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Role::Primary,
            1 => Role::Replica,
            _ => Role::Retired,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Role::Primary => 0,
            Role::Replica => 1,
            Role::Retired => 2,
        }
    }
}

/// Immutable health snapshot, replaced wholesale on every probe
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    pub is_healthy: bool,
    /// Selection weight, recomputed by the balancer on each health tick
    pub weight: u32,
    /// CPU utilization in percent (0-100)
    pub cpu_utilization: f64,
    /// Exponentially decayed average probe latency
    pub avg_response_time_ms: f64,
    pub replication_lag: Duration,
    pub memory_utilization: Option<f64>,
    pub disk_utilization: Option<f64>,
    pub last_checked_at: Option<Instant>,
    pub consecutive_failures: u32,
    /// Set when lag crosses the alert threshold, cleared only once lag drops
    /// below the recovery threshold
    pub lagging: bool,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            weight: 100,
            cpu_utilization: 0.0,
            avg_response_time_ms: 0.0,
            replication_lag: Duration::ZERO,
            memory_utilization: None,
            disk_utilization: None,
            last_checked_at: None,
            consecutive_failures: 0,
            lagging: false,
        }
    }
}

impl EndpointHealth {
    /// Fold a successful probe into the snapshot
    ///
    /// `alpha` is the weight given to the newest latency sample.
    pub fn apply_probe(&mut self, report: &ProbeReport, alpha: f64) {
        let latency_ms = report.latency.as_secs_f64() * 1_000.0;
        self.avg_response_time_ms = if self.last_checked_at.is_none() {
            latency_ms
        } else {
            alpha * latency_ms + (1.0 - alpha) * self.avg_response_time_ms
        };
        self.is_healthy = true;
        self.cpu_utilization = report.cpu_utilization;
        self.replication_lag = report.replication_lag.unwrap_or(Duration::ZERO);
        self.memory_utilization = report.memory_utilization;
        self.disk_utilization = report.disk_utilization;
        self.last_checked_at = Some(Instant::now());
        self.consecutive_failures = 0;
    }
}

/// A store target tracked by the health monitor and load balancer
///
/// The request path reads the health snapshot lock-free; only the health
/// task for this target (and failover) replaces it.
#[derive(Debug)]
pub struct Endpoint {
    target: Target,
    health: ArcSwap<EndpointHealth>,
    role: AtomicU8,
    active_connections: AtomicU32,
}

impl Endpoint {
    pub fn new(target: Target, role: Role) -> Self {
        Self {
            target,
            health: ArcSwap::from_pointee(EndpointHealth::default()),
            role: AtomicU8::new(role.as_u8()),
            active_connections: AtomicU32::new(0),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn id(&self) -> &TargetId {
        &self.target.id
    }

    /// Current health snapshot
    pub fn health(&self) -> Arc<EndpointHealth> {
        self.health.load_full()
    }

    /// Replace the snapshot with a modified copy
    ///
    /// `update` may run more than once if another writer races this one.
    pub fn update_health<F>(&self, update: F) -> Arc<EndpointHealth>
    where
        F: Fn(&mut EndpointHealth),
    {
        self.health.rcu(|current| {
            let mut next = EndpointHealth::clone(current);
            update(&mut next);
            next
        });
        self.health.load_full()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.load().is_healthy
    }

    pub fn is_lagging(&self) -> bool {
        self.health.load().lagging
    }

    pub fn weight(&self) -> u32 {
        self.health.load().weight
    }

    pub fn replication_lag(&self) -> Duration {
        self.health.load().replication_lag
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    /// Healthy replica eligible for read traffic
    pub fn is_selectable(&self) -> bool {
        self.role() == Role::Replica && self.is_healthy()
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        // Saturate instead of wrapping if a release races a reset.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EndpointStats {
        let health = self.health();
        EndpointStats {
            target: self.target.id.clone(),
            role: self.role(),
            is_healthy: health.is_healthy,
            weight: health.weight,
            cpu_utilization: health.cpu_utilization,
            avg_response_time_ms: health.avg_response_time_ms,
            replication_lag_ms: health.replication_lag.as_millis() as u64,
            memory_utilization: health.memory_utilization,
            disk_utilization: health.disk_utilization,
            lagging: health.lagging,
            consecutive_failures: health.consecutive_failures,
            active_connections: self.active_connections(),
            since_last_check_ms: health
                .last_checked_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

/// Point-in-time view of an endpoint for stats output
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub target: TargetId,
    pub role: Role,
    pub is_healthy: bool,
    pub weight: u32,
    pub cpu_utilization: f64,
    pub avg_response_time_ms: f64,
    pub replication_lag_ms: u64,
    pub memory_utilization: Option<f64>,
    pub disk_utilization: Option<f64>,
    pub lagging: bool,
    pub consecutive_failures: u32,
    pub active_connections: u32,
    pub since_last_check_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn replica(id: &str) -> Endpoint {
        Endpoint::new(Target::new(id, format!("mem://{}", id)), Role::Replica)
    }

    #[test]
    fn test_endpoint_creation() {
        let endpoint = replica("r1");
        assert_eq!(endpoint.id(), "r1");
        assert_eq!(endpoint.role(), Role::Replica);
        assert_eq!(endpoint.active_connections(), 0);
        assert!(endpoint.is_healthy());
        assert!(endpoint.is_selectable());
        assert!(endpoint.health().last_checked_at.is_none());
    }

    #[test]
    fn test_role_changes_affect_selection() {
        let endpoint = replica("r1");
        endpoint.set_role(Role::Primary);
        assert!(!endpoint.is_selectable());
        endpoint.set_role(Role::Retired);
        assert_eq!(endpoint.role(), Role::Retired);
        assert!(!endpoint.is_selectable());
    }

    #[tokio::test]
    async fn test_probe_decays_response_time() {
        let endpoint = replica("r1");
        let report = |ms| ProbeReport {
            latency: Duration::from_millis(ms),
            cpu_utilization: 40.0,
            replication_lag: Some(Duration::from_millis(300)),
            ..Default::default()
        };

        let first = endpoint.update_health(|h| h.apply_probe(&report(100), 0.5));
        assert_eq!(first.avg_response_time_ms, 100.0);
        assert_eq!(first.replication_lag, Duration::from_millis(300));

        let second = endpoint.update_health(|h| h.apply_probe(&report(200), 0.5));
        assert_eq!(second.avg_response_time_ms, 150.0);
        assert_eq!(second.cpu_utilization, 40.0);
        assert!(second.last_checked_at.is_some());
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let endpoint = replica("r1");
        let before = endpoint.health();
        endpoint.update_health(|h| h.is_healthy = false);

        assert!(before.is_healthy);
        assert!(!endpoint.is_healthy());
    }

    #[test]
    fn test_connection_tracking() {
        let endpoint = Arc::new(replica("r1"));
        let other = Arc::clone(&endpoint);

        let handle = thread::spawn(move || {
            for _ in 0..100 {
                other.increment_connections();
                other.decrement_connections();
            }
        });
        for _ in 0..100 {
            endpoint.increment_connections();
            endpoint.decrement_connections();
        }
        handle.join().unwrap();

        assert_eq!(endpoint.active_connections(), 0);
        endpoint.decrement_connections();
        assert_eq!(endpoint.active_connections(), 0);
    }
}
