//! Periodic health probing and primary failover
//!
//! One task per target probes on a fixed interval. A primary that stops
//! answering is replaced by the healthiest replica within the failover
//! deadline; past it the outage is escalated and left to an operator.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::balancer::LoadBalancer;
use super::endpoint::{Endpoint, EndpointStats};
use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use crate::isolation::Topology;
use crate::pool::ConnectionPoolManager;
use crate::store::{DataStore, ProbeReport, StoreError, TargetId};

/// Configuration for health checking
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Whether periodic probing is enabled
    pub enabled: bool,
    /// Interval between probes of one target
    pub interval: Duration,
    /// Timeout for a single probe
    pub probe_timeout: Duration,
    /// Replication lag above which a replica is latched as lagging
    pub lag_alert_threshold: Duration,
    /// Replication lag below which the latch is released
    pub lag_recovery_threshold: Duration,
    /// Time from detecting a dead primary to a completed promotion
    pub failover_deadline: Duration,
    /// Consecutive failed probes before a target is marked unhealthy
    pub failure_threshold: u32,
    /// Weight of the newest latency sample in the response time average
    pub response_time_decay: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            lag_alert_threshold: Duration::from_secs(5),
            lag_recovery_threshold: Duration::from_secs(2),
            failover_deadline: Duration::from_secs(30),
            failure_threshold: 1,
            response_time_decay: 0.3,
        }
    }
}

/// A completed failover
#[derive(Debug, Clone, Serialize)]
pub struct FailoverRecord {
    pub failed_primary: TargetId,
    pub new_primary: TargetId,
    pub elapsed_ms: u64,
}

/// Health statistics for all targets
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub primary: TargetId,
    pub endpoints: Vec<EndpointStats>,
    pub probes: u64,
    pub probe_failures: u64,
    pub failovers: u64,
    pub last_failover: Option<FailoverRecord>,
}

/// One outage of the primary, from first failed probe until it recovers or
/// is replaced
struct FailoverEpisode {
    failed_primary: TargetId,
    detected_at: Instant,
    /// The deadline passed; no further automatic promotion for this outage
    escalated: bool,
}

/// Probes every target and replaces a dead primary
pub struct HealthMonitor {
    topology: Arc<Topology>,
    balancer: Arc<LoadBalancer>,
    pools: Arc<ConnectionPoolManager>,
    store: Arc<dyn DataStore>,
    config: HealthCheckConfig,
    events: EventBus,
    /// Serializes promotions
    failover_lock: tokio::sync::Mutex<()>,
    episode: Mutex<Option<FailoverEpisode>>,
    last_failover: Mutex<Option<FailoverRecord>>,
    probes: AtomicU64,
    probe_failures: AtomicU64,
    failovers: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        pools: Arc<ConnectionPoolManager>,
        store: Arc<dyn DataStore>,
        config: HealthCheckConfig,
        events: EventBus,
    ) -> Self {
        let topology = Arc::clone(pools.isolator().topology());
        let balancer = Arc::clone(pools.isolator().balancer());
        Self {
            topology,
            balancer,
            pools,
            store,
            config,
            events,
            failover_lock: tokio::sync::Mutex::new(()),
            episode: Mutex::new(None),
            last_failover: Mutex::new(None),
            probes: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start one probe task per target
    ///
    /// Tasks run until `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Health monitor disabled - all targets remain healthy by default");
            return Vec::new();
        }

        info!(
            interval_s = self.config.interval.as_secs(),
            targets = self.topology.endpoints().len(),
            "Health monitor started"
        );

        self.topology
            .endpoints()
            .iter()
            .map(|endpoint| {
                let monitor = Arc::clone(self);
                let endpoint = Arc::clone(endpoint);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(monitor.config.interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                monitor.check_endpoint(&endpoint).await;
                            }
                        }
                    }
                    debug!(target_id = %endpoint.id(), "Health probe loop stopped");
                })
            })
            .collect()
    }

    /// Probe every target once, concurrently
    pub async fn check_now(self: &Arc<Self>) -> HealthStats {
        let mut probes = JoinSet::new();
        for endpoint in self.topology.endpoints() {
            let monitor = Arc::clone(self);
            let endpoint = Arc::clone(endpoint);
            probes.spawn(async move { monitor.check_endpoint(&endpoint).await });
        }
        while probes.join_next().await.is_some() {}
        self.stats()
    }

    /// Probe one target and publish the result
    ///
    /// Returns whether the target answered.
    pub async fn check_endpoint(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = tokio::time::timeout(self.config.probe_timeout, self.store.ping(endpoint.target()))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.config.probe_timeout)));

        match result {
            Ok(report) => {
                debug!(
                    target_id = %endpoint.id(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    cpu = report.cpu_utilization,
                    "Health probe OK"
                );
                self.on_probe_success(endpoint, &report);
                true
            }
            Err(e) => {
                self.probe_failures.fetch_add(1, Ordering::Relaxed);
                self.on_probe_failure(endpoint, e).await;
                false
            }
        }
    }

    fn on_probe_success(&self, endpoint: &Arc<Endpoint>, report: &ProbeReport) {
        let before = endpoint.health();
        let lag = report.replication_lag.unwrap_or(Duration::ZERO);
        let lagging = if before.lagging {
            lag >= self.config.lag_recovery_threshold
        } else {
            lag > self.config.lag_alert_threshold
        };

        let alpha = self.config.response_time_decay;
        endpoint.update_health(|h| {
            h.apply_probe(report, alpha);
            h.lagging = lagging;
        });
        self.balancer.refresh_weight(endpoint);

        if !before.is_healthy {
            info!(target_id = %endpoint.id(), "Target recovered");
            self.events.publish(ResilienceEvent::TargetRecovered {
                target: endpoint.id().clone(),
            });
        }

        if lagging && !before.lagging {
            warn!(target_id = %endpoint.id(), lag_ms = lag.as_millis() as u64, "Replication lag high");
            self.events.publish(ResilienceEvent::ReplicationLagHigh {
                target: endpoint.id().clone(),
                lag,
            });
        } else if !lagging && before.lagging {
            info!(target_id = %endpoint.id(), lag_ms = lag.as_millis() as u64, "Replication lag recovered");
            self.events.publish(ResilienceEvent::ReplicationLagRecovered {
                target: endpoint.id().clone(),
                lag,
            });
        }

        let mut episode = self.episode.lock();
        if episode
            .as_ref()
            .is_some_and(|e| &e.failed_primary == endpoint.id())
        {
            info!(target_id = %endpoint.id(), "Primary answered again before failover");
            *episode = None;
        }
    }

    async fn on_probe_failure(&self, endpoint: &Arc<Endpoint>, error: StoreError) {
        let before = endpoint.health();
        let failures = before.consecutive_failures + 1;
        let unhealthy = failures >= self.config.failure_threshold;

        endpoint.update_health(|h| {
            h.consecutive_failures = failures;
            h.last_checked_at = Some(Instant::now());
            if unhealthy {
                h.is_healthy = false;
            }
        });

        if !unhealthy {
            debug!(target_id = %endpoint.id(), failures = failures, error = %error, "Health probe failed");
            return;
        }

        if before.is_healthy {
            warn!(target_id = %endpoint.id(), error = %error, "Target unhealthy");
            self.events.publish(ResilienceEvent::TargetUnhealthy {
                target: endpoint.id().clone(),
                reason: error.to_string(),
            });
        }

        if Arc::ptr_eq(&self.topology.primary(), endpoint) {
            self.handle_primary_failure(endpoint).await;
        }
    }

    async fn handle_primary_failure(&self, failed: &Arc<Endpoint>) {
        let detected_at = {
            let mut episode = self.episode.lock();
            match episode.as_ref() {
                Some(e) if &e.failed_primary == failed.id() => {
                    if e.escalated {
                        debug!(target_id = %failed.id(), "Failover already escalated, waiting for an operator");
                        return;
                    }
                    e.detected_at
                }
                _ => {
                    let now = Instant::now();
                    *episode = Some(FailoverEpisode {
                        failed_primary: failed.id().clone(),
                        detected_at: now,
                        escalated: false,
                    });
                    now
                }
            }
        };

        if let Err(e) = self.failover(failed, detected_at).await {
            error!(failed_primary = %failed.id(), error = %e, "Failover did not complete");
        }
    }

    /// Replace the current primary now, regardless of its probe state
    ///
    /// Starts a fresh failover window, so this also retries after an
    /// escalated timeout.
    pub async fn trigger_failover(&self) -> Result<Arc<Endpoint>, ResilienceError> {
        let failed = self.topology.primary();
        let detected_at = Instant::now();
        *self.episode.lock() = Some(FailoverEpisode {
            failed_primary: failed.id().clone(),
            detected_at,
            escalated: false,
        });
        self.failover(&failed, detected_at).await
    }

    async fn failover(
        &self,
        failed: &Arc<Endpoint>,
        detected_at: Instant,
    ) -> Result<Arc<Endpoint>, ResilienceError> {
        let _guard = self.failover_lock.lock().await;

        let current = self.topology.primary();
        if !Arc::ptr_eq(&current, failed) {
            // Another task finished the promotion while we waited.
            return Ok(current);
        }

        let remaining = self
            .config
            .failover_deadline
            .saturating_sub(detected_at.elapsed());
        if remaining.is_zero() {
            return Err(self.escalate(failed, detected_at.elapsed()));
        }

        let candidate = self
            .select_candidate()
            .ok_or_else(|| ResilienceError::NoFailoverCandidate(failed.id().clone()))?;

        warn!(
            failed_primary = %failed.id(),
            candidate = %candidate.id(),
            lag_ms = candidate.replication_lag().as_millis() as u64,
            "Starting failover"
        );
        self.events.publish(ResilienceEvent::FailoverStarted {
            failed_primary: failed.id().clone(),
            candidate: candidate.id().clone(),
        });

        match tokio::time::timeout(remaining, self.store.promote(candidate.target())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(self.escalate(failed, detected_at.elapsed())),
        }

        // Moving the primary pointer commits the failover; the deadline
        // does not cover the cleanup after it.
        self.topology.promote(&candidate);
        let elapsed = detected_at.elapsed();
        if let Err(e) = self.pools.rebuild_priority(candidate.id()).await {
            error!(new_primary = %candidate.id(), error = %e, "Priority pool rebuild failed");
        }

        self.failovers.fetch_add(1, Ordering::Relaxed);
        *self.episode.lock() = None;
        *self.last_failover.lock() = Some(FailoverRecord {
            failed_primary: failed.id().clone(),
            new_primary: candidate.id().clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        info!(
            old_primary = %failed.id(),
            new_primary = %candidate.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Failover completed"
        );
        self.events.publish(ResilienceEvent::FailoverCompleted {
            old_primary: failed.id().clone(),
            new_primary: candidate.id().clone(),
            elapsed,
        });
        Ok(candidate)
    }

    fn escalate(&self, failed: &Arc<Endpoint>, elapsed: Duration) -> ResilienceError {
        if let Some(episode) = self.episode.lock().as_mut() {
            episode.escalated = true;
        }
        error!(
            failed_primary = %failed.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Failover deadline exceeded, manual intervention required"
        );
        self.events.publish(ResilienceEvent::FailoverTimeout {
            failed_primary: failed.id().clone(),
            elapsed,
        });
        ResilienceError::FailoverTimeout {
            failed_primary: failed.id().clone(),
            elapsed,
        }
    }

    /// Healthiest replica: lowest lag, then lowest CPU
    fn select_candidate(&self) -> Option<Arc<Endpoint>> {
        self.topology
            .replicas()
            .filter(|e| e.is_healthy())
            .min_by(|a, b| {
                let (a, b) = (a.health(), b.health());
                a.replication_lag
                    .cmp(&b.replication_lag)
                    .then(a.cpu_utilization.total_cmp(&b.cpu_utilization))
            })
            .cloned()
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            primary: self.topology.primary_id(),
            endpoints: self.topology.endpoints().iter().map(|e| e.stats()).collect(),
            probes: self.probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            last_failover: self.last_failover.lock().clone(),
        }
    }
}
