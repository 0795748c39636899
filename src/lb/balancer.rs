//! Replica selection
//!
//! Weights come from the health snapshot of each replica and are refreshed
//! on every health tick. The primary and retired targets share the endpoint
//! list but never take part in selection.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::endpoint::{Endpoint, EndpointHealth};
use crate::store::TargetId;

/// Load balancing algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Smooth weighted round-robin over health-derived weights
    #[default]
    WeightedRoundRobin,
    /// Simple round-robin distribution
    RoundRobin,
    /// Pick 2 random replicas, choose the one with fewer connections
    PowerOfTwo,
    /// Always pick the replica with the least connections
    LeastConnections,
}

/// Weight calculation parameters
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub algorithm: Algorithm,
    /// Weight of an idle, fast replica
    pub base_weight: u32,
    /// Share of CPU in the load blend (the rest is response time)
    pub cpu_share: f64,
    /// Response time treated as fully loaded
    pub response_time_ceiling_ms: f64,
    /// CPU percentage above which the weight is halved
    pub high_cpu_threshold: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::WeightedRoundRobin,
            base_weight: 100,
            cpu_share: 0.5,
            response_time_ceiling_ms: 1_000.0,
            high_cpu_threshold: 80.0,
        }
    }
}

/// Outcome of a replica selection
#[derive(Debug, Clone)]
pub enum Selection {
    Replica(Arc<Endpoint>),
    /// No healthy replica: the caller should read from the primary
    PrimaryFallback,
}

/// Selects a replica for each read
pub struct LoadBalancer {
    endpoints: Vec<Arc<Endpoint>>,
    config: LoadBalancerConfig,
    counter: AtomicUsize,
    /// Running weights for smooth weighted round-robin
    current_weights: Mutex<HashMap<TargetId, i64>>,
    fallbacks: AtomicU64,
}

impl LoadBalancer {
    /// Create a balancer over every configured endpoint
    ///
    /// Only endpoints currently in the replica role and healthy take part in
    /// selection, so the primary and retired targets can share the list.
    pub fn new(endpoints: Vec<Arc<Endpoint>>, config: LoadBalancerConfig) -> Self {
        Self {
            endpoints,
            config,
            counter: AtomicUsize::new(0),
            current_weights: Mutex::new(HashMap::new()),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Times selection found no healthy replica
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Select a healthy replica using the configured algorithm
    pub fn select_replica(&self) -> Selection {
        let candidates: Vec<&Arc<Endpoint>> =
            self.endpoints.iter().filter(|e| e.is_selectable()).collect();

        if candidates.is_empty() {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            debug!("No healthy replica, falling back to primary");
            return Selection::PrimaryFallback;
        }

        let chosen = match self.config.algorithm {
            Algorithm::WeightedRoundRobin => self.select_weighted(&candidates),
            Algorithm::RoundRobin => self.select_round_robin(&candidates),
            Algorithm::PowerOfTwo => self.select_power_of_two(&candidates),
            Algorithm::LeastConnections => self.select_least_connections(&candidates),
        };
        Selection::Replica(Arc::clone(chosen))
    }

    /// Recompute and store the weight of one endpoint from its snapshot
    pub fn refresh_weight(&self, endpoint: &Endpoint) -> u32 {
        let weight = compute_weight(&endpoint.health(), &self.config);
        endpoint.update_health(|h| h.weight = weight);
        weight
    }

    /// Smooth weighted round-robin
    ///
    /// Every candidate's running weight grows by its weight; the largest
    /// wins and gives back the total. Picks interleave instead of arriving
    /// in runs.
    fn select_weighted<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let mut current = self.current_weights.lock();
        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;

        for (index, endpoint) in candidates.iter().enumerate() {
            let weight = endpoint.weight().max(1) as i64;
            total += weight;
            let running = current.entry(endpoint.id().clone()).or_insert(0);
            *running += weight;
            if best.map_or(true, |(_, top)| *running > top) {
                best = Some((index, *running));
            }
        }

        let index = best.map_or(0, |(index, _)| index);
        let chosen = candidates[index];
        if let Some(running) = current.get_mut(chosen.id()) {
            *running -= total;
        }
        chosen
    }

    fn select_round_robin<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index]
    }

    /// Power-of-two: pick 2 random, choose the one with fewer connections
    fn select_power_of_two<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let len = candidates.len();
        if len == 1 {
            return candidates[0];
        }

        let mut rng = rand::thread_rng();
        let a = candidates[rng.gen_range(0..len)];
        let b = candidates[rng.gen_range(0..len)];
        if a.active_connections() <= b.active_connections() {
            a
        } else {
            b
        }
    }

    fn select_least_connections<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        candidates
            .iter()
            .min_by_key(|e| e.active_connections())
            .copied()
            .unwrap_or(candidates[0])
    }
}

/// Selection weight for a replica
///
/// The weight is inversely proportional to a blend of CPU utilization and
/// average response time, each normalized to [0, 1]: an idle replica gets
/// `base_weight`, a saturated one a tenth of it. Above the CPU threshold the
/// weight is halved. It never drops below 1.
pub fn compute_weight(health: &EndpointHealth, config: &LoadBalancerConfig) -> u32 {
    let cpu_load = (health.cpu_utilization / 100.0).clamp(0.0, 1.0);
    let rt_load = if config.response_time_ceiling_ms > 0.0 {
        (health.avg_response_time_ms / config.response_time_ceiling_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let share = config.cpu_share.clamp(0.0, 1.0);
    let blend = share * cpu_load + (1.0 - share) * rt_load;

    let mut weight = config.base_weight as f64 / (1.0 + 9.0 * blend);
    if health.cpu_utilization > config.high_cpu_threshold {
        weight /= 2.0;
    }
    (weight.round() as u32).max(1)
}
