//! Sliding-window admission control
//!
//! Every identity gets a trailing window of admitted request timestamps,
//! and a shared `global` window bounds the whole process (or cluster, with a
//! shared [`RateLimitStore`]). A request is admitted only if both windows
//! have room, and only admitted requests are recorded.
//!
//! The limiter fails open: if the store errors or does not answer within
//! `store_timeout`, the request is admitted and a warning logged.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use crate::store::StoreError;

/// Which window rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Identity,
    Global,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        /// Requests left in the identity's window
        remaining: u32,
    },
    Rejected {
        scope: LimitScope,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Limits applied by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub per_identity: u32,
    pub global: u32,
    pub window: Duration,
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admitted requests per identity per window
    pub per_identity_limit: u32,
    /// Admitted requests across all identities per window
    pub global_limit: u32,
    pub window: Duration,
    /// Identities that skip both limits
    pub admin_identities: Vec<String>,
    /// Bound on a store round trip before failing open
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_identity_limit: 100,
            global_limit: 10_000,
            window: Duration::from_secs(60),
            admin_identities: Vec::new(),
            store_timeout: Duration::from_millis(250),
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self) -> WindowLimits {
        WindowLimits {
            per_identity: self.per_identity_limit,
            global: self.global_limit,
            window: self.window,
        }
    }
}

/// Backing state for sliding windows
///
/// An implementation shared between processes (a central store) gives
/// cluster-wide limits; it must check both windows and record the request
/// atomically.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check_and_record(&self, identity: &str, limits: &WindowLimits) -> Result<RateDecision, StoreError>;
}

/// In-process window store
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    windows: DashMap<String, VecDeque<Instant>>,
    global: Mutex<VecDeque<Instant>>,
    checks: AtomicU64,
}

/// Drop idle windows every this many checks
const SWEEP_EVERY: u64 = 1024;

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities with a live window
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    /// Remove windows with no requests left inside `window`
    pub fn sweep(&self, window: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.duration_since(oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// Time until the oldest timestamp leaves the window
fn retry_after(timestamps: &VecDeque<Instant>, now: Instant, window: Duration) -> Duration {
    timestamps
        .front()
        .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
        .unwrap_or(Duration::ZERO)
}

#[async_trait]
impl RateLimitStore for LocalWindowStore {
    async fn check_and_record(&self, identity: &str, limits: &WindowLimits) -> Result<RateDecision, StoreError> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(limits.window);
        }

        let now = Instant::now();
        // Lock order: global window, then the identity's shard.
        let mut global = self.global.lock();
        prune(&mut global, now, limits.window);
        let mut window = self.windows.entry(identity.to_string()).or_default();
        prune(&mut window, now, limits.window);

        if window.len() >= limits.per_identity as usize {
            return Ok(RateDecision::Rejected {
                scope: LimitScope::Identity,
                retry_after: retry_after(&window, now, limits.window),
            });
        }
        if global.len() >= limits.global as usize {
            return Ok(RateDecision::Rejected {
                scope: LimitScope::Global,
                retry_after: retry_after(&global, now, limits.window),
            });
        }

        window.push_back(now);
        global.push_back(now);
        Ok(RateDecision::Allowed {
            remaining: limits.per_identity.saturating_sub(window.len() as u32),
        })
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub rejected_identity: u64,
    pub rejected_global: u64,
    pub bypassed: u64,
    /// Checks admitted because the store failed or timed out
    pub failed_open: u64,
}

#[derive(Default)]
struct AtomicRateLimitStats {
    allowed: AtomicU64,
    rejected_identity: AtomicU64,
    rejected_global: AtomicU64,
    bypassed: AtomicU64,
    failed_open: AtomicU64,
}

/// Per-identity and global admission control
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    bypass: RwLock<HashSet<String>>,
    stats: AtomicRateLimitStats,
    events: EventBus,
}

impl RateLimiter {
    /// Limiter with in-process windows
    pub fn new(config: RateLimitConfig, events: EventBus) -> Self {
        Self::with_store(config, Arc::new(LocalWindowStore::new()), events)
    }

    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>, events: EventBus) -> Self {
        let bypass = config.admin_identities.iter().cloned().collect();
        Self {
            config,
            store,
            bypass: RwLock::new(bypass),
            stats: AtomicRateLimitStats::default(),
            events,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Grant or revoke the administrative bypass at runtime
    pub fn set_bypass(&self, identity: &str, bypass: bool) {
        let mut set = self.bypass.write();
        if bypass {
            set.insert(identity.to_string());
        } else {
            set.remove(identity);
        }
    }

    pub fn is_bypassed(&self, identity: &str) -> bool {
        self.bypass.read().contains(identity)
    }

    /// Check and record one request
    pub async fn allow(&self, identity: &str) -> RateDecision {
        if self.is_bypassed(identity) {
            self.stats.bypassed.fetch_add(1, Ordering::Relaxed);
            return RateDecision::Allowed {
                remaining: self.config.per_identity_limit,
            };
        }

        let limits = self.config.limits();
        let result = tokio::time::timeout(
            self.config.store_timeout,
            self.store.check_and_record(identity, &limits),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(self.config.store_timeout)));

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.failed_open.fetch_add(1, Ordering::Relaxed);
                warn!(identity = %identity, error = %e, "Rate limit store failed, admitting request");
                return RateDecision::Allowed {
                    remaining: limits.per_identity,
                };
            }
        };

        match decision {
            RateDecision::Allowed { .. } => {
                self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            }
            RateDecision::Rejected { scope, retry_after } => {
                let counter = match scope {
                    LimitScope::Identity => &self.stats.rejected_identity,
                    LimitScope::Global => &self.stats.rejected_global,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(
                    identity = %identity,
                    scope = ?scope,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rate limited"
                );
                self.events.publish(ResilienceEvent::RateLimited {
                    identity: identity.to_string(),
                    retry_after,
                });
            }
        }
        decision
    }

    /// [`allow`](Self::allow) as a `Result`
    pub async fn check(&self, identity: &str) -> Result<(), ResilienceError> {
        match self.allow(identity).await {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Rejected { scope, retry_after } => Err(ResilienceError::RateLimited {
                identity: identity.to_string(),
                scope,
                retry_after,
            }),
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            rejected_identity: self.stats.rejected_identity.load(Ordering::Relaxed),
            rejected_global: self.stats.rejected_global.load(Ordering::Relaxed),
            bypassed: self.stats.bypassed.load(Ordering::Relaxed),
            failed_open: self.stats.failed_open.load(Ordering::Relaxed),
        }
    }
}
