//! Per-target connection pooling
//!
//! This module provides a bounded pool of store connections for one target:
//! - Semaphore-bounded checkout, callers suspend until a slot frees up
//! - Idle reuse with validation, idle reaping above the minimum size
//! - Circuit-breaker gated connection attempts with exponential backoff
//! - RAII checkout guard that returns the connection even on cancellation

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit::{Admission, CircuitBreaker, CircuitError};
use crate::events::{EventBus, ResilienceEvent};
use crate::store::{
    DataStore, Query, Rows, StoreConnection, StoreError, Target, TargetId, WriteOutcome,
};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is exhausted for {target} after {waited:?}")]
    PoolExhausted { target: TargetId, waited: Duration },

    #[error("Failed to connect to {target} after {attempts} attempts: {source}")]
    ConnectionFailed {
        target: TargetId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Circuit(#[from] CircuitError),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("Pool for {0} is shut down")]
    Closed(TargetId),

    #[error("Acquire cancelled")]
    Cancelled,

    #[error("Deadline exceeded while acquiring a connection")]
    DeadlineExceeded,
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (active + idle)
    pub max_connections: usize,

    /// Minimum number of connections to keep warm
    pub min_connections: usize,

    /// How long an acquire waits for a free slot before `PoolExhausted`
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed by the reaper
    pub idle_timeout: Duration,

    /// Period of the background reaper
    pub reap_interval: Duration,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// Retries after the first failed connection attempt
    pub max_retries: u32,

    /// First backoff delay, doubled on each retry
    pub backoff_base: Duration,

    /// Utilization (0.0-1.0) above which a warning is logged
    pub utilization_warn_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            utilization_warn_threshold: 0.8,
        }
    }
}

impl PoolConfig {
    /// Backoff before retry number `retry` (1-based): base, 2*base, 4*base...
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub name: String,
    pub target: TargetId,
    pub max_connections: usize,
    pub min_connections: usize,

    /// Connections checked out right now
    pub active_connections: usize,

    /// Connections parked in the pool
    pub idle_connections: usize,

    /// Active + idle + connects in flight
    pub total_connections: usize,

    /// Total connections created
    pub total_created: u64,

    /// Total checkouts served from the idle list
    pub total_reused: u64,

    /// Failed connection attempts
    pub failed_attempts: u64,

    /// Acquires that timed out waiting for a slot
    pub exhausted_count: u64,

    /// Connections closed by the reaper, validation or shutdown
    pub total_closed: u64,

    /// Sum of time callers spent waiting for a slot
    pub total_wait_ms: u64,

    /// Average wait per successful acquire
    pub avg_wait_ms: f64,

    /// active / max
    pub utilization: f64,
}

#[derive(Default)]
struct AtomicPoolStats {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    failed_attempts: AtomicU64,
    exhausted_count: AtomicU64,
    total_closed: AtomicU64,
    total_wait_us: AtomicU64,
    acquisitions: AtomicU64,
}

/// An idle connection with its bookkeeping
struct IdleConnection {
    conn: Box<dyn StoreConnection>,
    idle_since: Instant,
    created_at: Instant,
    use_count: u64,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    /// Connections in existence, active or idle, including slots reserved
    /// for an in-flight connect
    total: usize,
    closed: bool,
}

/// Placeholder swapped in when the real connection leaves the guard
struct Detached;

#[async_trait]
impl StoreConnection for Detached {
    async fn execute_read(&mut self, _query: &Query) -> Result<Rows, StoreError> {
        Err(StoreError::ConnectionLost("connection returned to pool".to_string()))
    }

    async fn execute_write(&mut self, _query: &Query) -> Result<WriteOutcome, StoreError> {
        Err(StoreError::ConnectionLost("connection returned to pool".to_string()))
    }

    async fn is_valid(&self) -> bool {
        false
    }
}

/// A checked-out connection
///
/// Dropping the guard returns the connection to its pool; a connection
/// marked broken is discarded instead.
pub struct PooledConnection {
    conn: Box<dyn StoreConnection>,
    pool: Arc<TargetPool>,
    permit: Option<OwnedSemaphorePermit>,
    created_at: Instant,
    checked_out_at: Instant,
    use_count: u64,
    broken: bool,
    /// Breaker grant this connection was obtained under
    admission: Admission,
}

impl PooledConnection {
    pub fn target(&self) -> &Target {
        &self.pool.target
    }

    /// Name of the pool this connection belongs to
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn time_in_use(&self) -> Duration {
        self.checked_out_at.elapsed()
    }

    /// Discard instead of returning to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Report a connection-level failure observed while using this
    /// connection. Counts against the target's breaker and discards it.
    pub fn report_failure(&mut self) {
        self.broken = true;
        self.pool.breaker.record_failure(self.admission);
    }

    /// Report a successful round trip on this connection to the breaker
    pub fn report_success(&self) {
        self.pool.breaker.record_success(self.admission);
    }

    /// Return the connection to the pool explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("target", &self.pool.target.id)
            .field("use_count", &self.use_count)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = std::mem::replace(&mut self.conn, Box::new(Detached));
        self.pool.active.fetch_sub(1, Ordering::AcqRel);

        if self.broken {
            debug!(pool = %self.pool.name, "Discarding broken connection");
            self.pool.discard(1);
        } else {
            self.pool.check_in(IdleConnection {
                conn,
                idle_since: Instant::now(),
                created_at: self.created_at,
                use_count: self.use_count,
            });
        }

        // The permit is released only after the connection is back in the
        // idle list, so a waiter woken by it always finds it there.
        drop(self.permit.take());
    }
}

/// Releases a reserved slot unless the connect succeeded
struct SlotGuard<'a> {
    pool: &'a TargetPool,
    armed: bool,
}

impl SlotGuard<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// Bounded connection pool for a single target
pub struct TargetPool {
    name: String,
    target: Target,
    store: Arc<dyn DataStore>,
    breaker: Arc<CircuitBreaker>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    active: AtomicUsize,
    stats: AtomicPoolStats,
    high_utilization: AtomicBool,
    events: EventBus,
}

impl TargetPool {
    pub fn new(
        name: impl Into<String>,
        target: Target,
        store: Arc<dyn DataStore>,
        breaker: Arc<CircuitBreaker>,
        config: PoolConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            target,
            store,
            breaker,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.max_connections),
                total: 0,
                closed: false,
            }),
            config,
            active: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            high_utilization: AtomicBool::new(false),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Open connections up to the configured minimum
    ///
    /// Failures are logged and reported to the breaker but are not fatal:
    /// the reaper tops the pool up again on later passes.
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        while let Some(slot) = self.reserve_below(self.config.min_connections) {
            match tokio::time::timeout(self.config.connect_timeout, self.store.connect(&self.target)).await {
                Ok(Ok(conn)) => {
                    self.breaker.record_success(Admission::Normal);
                    self.stats.total_created.fetch_add(1, Ordering::Relaxed);
                    slot.commit();
                    self.check_in(IdleConnection {
                        conn,
                        idle_since: Instant::now(),
                        created_at: Instant::now(),
                        use_count: 0,
                    });
                    opened += 1;
                }
                Ok(Err(e)) => {
                    self.breaker.record_failure(Admission::Normal);
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(pool = %self.name, error = %e, "Pre-warm connection failed");
                    break;
                }
                Err(_) => {
                    self.breaker.record_failure(Admission::Normal);
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(pool = %self.name, "Pre-warm connection timed out");
                    break;
                }
            }
        }

        if opened > 0 {
            info!(pool = %self.name, opened = opened, "Pool warmed up");
        }
        opened
    }

    /// Check out a connection
    ///
    /// Waits up to `acquire_timeout` (or the deadline, if sooner) for a free
    /// slot, then reuses an idle connection or opens a new one.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.target.id.clone()));
        }

        let start = Instant::now();
        let mut wait = self.config.acquire_timeout;
        let mut deadline_bound = false;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(start);
            if remaining.is_zero() {
                return Err(PoolError::DeadlineExceeded);
            }
            if remaining < wait {
                wait = remaining;
                deadline_bound = true;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed(self.target.id.clone())),
                    Err(_) if deadline_bound => return Err(PoolError::DeadlineExceeded),
                    Err(_) => return Err(self.exhausted(start.elapsed())),
                }
            }
        };

        let waited = start.elapsed();
        self.stats
            .total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);

        let mut admission = self.breaker.check_request()?;
        let trial = admission.is_trial();

        // A half-open trial must be a real connection attempt.
        let reused = if trial { None } else { self.take_idle().await };
        let (conn, created_at, use_count) = match reused {
            Some(idle) => self.reuse(idle),
            None => match self.reserve_slot(trial).await {
                Some(slot) => {
                    let (conn, granted) = self.open(slot, admission, cancel, deadline).await?;
                    admission = granted;
                    (conn, Instant::now(), 0)
                }
                // Maintenance may have refilled the pool between our checks.
                None => match self.take_idle().await {
                    Some(idle) => self.reuse(idle),
                    None => return Err(self.exhausted(start.elapsed())),
                },
            },
        };

        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.check_utilization(active);

        debug!(
            pool = %self.name,
            active = active,
            waited_ms = waited.as_millis() as u64,
            "Connection acquired"
        );

        Ok(PooledConnection {
            conn,
            pool: Arc::clone(self),
            permit: Some(permit),
            created_at,
            checked_out_at: Instant::now(),
            use_count: use_count + 1,
            broken: false,
            admission,
        })
    }

    fn reuse(&self, idle: IdleConnection) -> (Box<dyn StoreConnection>, Instant, u64) {
        self.stats.total_reused.fetch_add(1, Ordering::Relaxed);
        (idle.conn, idle.created_at, idle.use_count)
    }

    /// Open a new connection into a reserved slot, retrying with
    /// exponential backoff
    ///
    /// Returns the connection with the breaker grant its final attempt ran
    /// under.
    async fn open(
        &self,
        slot: SlotGuard<'_>,
        mut admission: Admission,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(Box<dyn StoreConnection>, Admission), PoolError> {
        let attempts = async {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let result =
                    tokio::time::timeout(self.config.connect_timeout, self.store.connect(&self.target))
                        .await
                        .unwrap_or(Err(StoreError::Timeout(self.config.connect_timeout)));

                let error = match result {
                    Ok(conn) => {
                        self.breaker.record_success(admission);
                        self.stats.total_created.fetch_add(1, Ordering::Relaxed);
                        return Ok((conn, admission));
                    }
                    Err(e) => e,
                };

                self.breaker.record_failure(admission);
                self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);

                if attempt > self.config.max_retries {
                    warn!(
                        pool = %self.name,
                        attempts = attempt,
                        error = %error,
                        "Giving up on connection attempts"
                    );
                    return Err(PoolError::ConnectionFailed {
                        target: self.target.id.clone(),
                        attempts: attempt,
                        source: error,
                    });
                }

                let backoff = self.config.backoff_for(attempt);
                warn!(
                    pool = %self.name,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Connection attempt failed, backing off"
                );
                tokio::time::sleep(backoff).await;

                // The failures so far may have opened the circuit.
                match self.breaker.check_request() {
                    Ok(granted) => admission = granted,
                    Err(e) => return Err(PoolError::Circuit(e)),
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            r = async {
                match deadline {
                    Some(d) => tokio::time::timeout_at(d, attempts)
                        .await
                        .unwrap_or(Err(PoolError::DeadlineExceeded)),
                    None => attempts.await,
                }
            } => r,
        };

        if result.is_ok() {
            slot.commit();
        }
        result
    }

    /// Pop a usable idle connection, discarding expired or invalid ones
    async fn take_idle(&self) -> Option<IdleConnection> {
        loop {
            let candidate = {
                let mut state = self.state.lock();
                state.idle.pop()
            }?;

            if candidate.idle_since.elapsed() > self.config.idle_timeout {
                debug!(pool = %self.name, "Discarding expired idle connection");
                self.close_discarded(candidate).await;
                continue;
            }

            if candidate.conn.is_valid().await {
                return Some(candidate);
            }

            debug!(pool = %self.name, "Discarding invalid idle connection");
            self.close_discarded(candidate).await;
        }
    }

    async fn close_discarded(&self, mut idle: IdleConnection) {
        self.discard(1);
        idle.conn.close().await;
    }

    /// Reserve room for one new connection
    ///
    /// With `evict_idle`, an idle connection is closed to make room when the
    /// pool is full, so a half-open trial always gets a fresh connection.
    async fn reserve_slot(&self, evict_idle: bool) -> Option<SlotGuard<'_>> {
        let evicted = {
            let mut state = self.state.lock();
            if state.total < self.config.max_connections {
                state.total += 1;
                None
            } else if evict_idle {
                // The evicted connection's slot passes to the caller.
                Some(state.idle.pop()?)
            } else {
                return None;
            }
        };

        if let Some(mut idle) = evicted {
            self.stats.total_closed.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, "Closing idle connection to make room for trial");
            idle.conn.close().await;
        }

        Some(SlotGuard {
            pool: self,
            armed: true,
        })
    }

    /// Reserve a slot only while the pool holds fewer than `floor` connections
    fn reserve_below(&self, floor: usize) -> Option<SlotGuard<'_>> {
        let mut state = self.state.lock();
        if state.closed || state.total >= floor.min(self.config.max_connections) {
            return None;
        }
        state.total += 1;
        Some(SlotGuard {
            pool: self,
            armed: true,
        })
    }

    fn check_in(&self, idle: IdleConnection) {
        let mut state = self.state.lock();
        if state.closed {
            state.total = state.total.saturating_sub(1);
            self.stats.total_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.idle.push(idle);
    }

    fn discard(&self, count: usize) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(count);
        self.stats
            .total_closed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        self.stats.exhausted_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            pool = %self.name,
            waited_ms = waited.as_millis() as u64,
            max = self.config.max_connections,
            "Pool exhausted"
        );
        self.events.publish(ResilienceEvent::PoolExhausted {
            target: self.target.id.clone(),
            waited,
        });
        PoolError::PoolExhausted {
            target: self.target.id.clone(),
            waited,
        }
    }

    fn check_utilization(&self, active: usize) {
        let utilization = active as f64 / self.config.max_connections.max(1) as f64;
        if utilization > self.config.utilization_warn_threshold {
            if !self.high_utilization.swap(true, Ordering::AcqRel) {
                warn!(
                    pool = %self.name,
                    utilization = utilization,
                    active = active,
                    max = self.config.max_connections,
                    "Pool utilization high"
                );
                self.events.publish(ResilienceEvent::PoolUtilizationHigh {
                    target: self.target.id.clone(),
                    utilization,
                });
            }
        } else {
            self.high_utilization.store(false, Ordering::Release);
        }
    }

    /// Close connections idle longer than `idle_timeout`, keeping at least
    /// `min_connections` in the pool
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            let mut removable = state.total.saturating_sub(self.config.min_connections);
            let idle_timeout = self.config.idle_timeout;

            let mut kept = Vec::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            // Oldest first: the idle list is LIFO, so the front idled longest.
            for idle in state.idle.drain(..) {
                if removable > 0 && idle.idle_since.elapsed() > idle_timeout {
                    removable -= 1;
                    expired.push(idle);
                } else {
                    kept.push(idle);
                }
            }
            state.idle = kept;
            state.total -= expired.len();
            expired
        };

        let removed = expired.len();
        for mut idle in expired {
            idle.conn.close().await;
        }

        if removed > 0 {
            self.stats
                .total_closed
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(pool = %self.name, removed = removed, "Reaped idle connections");
        }
        removed
    }

    /// One maintenance pass: reap expired idle connections, then top the
    /// pool back up to its minimum while the target's circuit is closed
    pub async fn maintain(&self) {
        self.reap_idle().await;
        if self.breaker.is_healthy() {
            self.warm_up().await;
        }
    }

    /// Spawn the periodic maintenance task
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(pool = %pool.name, "Running pool maintenance");
                        pool.maintain().await;
                    }
                }
            }
            debug!(pool = %pool.name, "Pool maintenance stopped");
        })
    }

    /// Close all idle connections and reject further acquires
    pub async fn shutdown(&self) {
        let idle: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        self.semaphore.close();

        let closed = idle.len();
        for mut conn in idle {
            conn.conn.close().await;
        }
        self.stats
            .total_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        info!(pool = %self.name, closed = closed, "Pool shut down");
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let (idle, total) = {
            let state = self.state.lock();
            (state.idle.len(), state.total)
        };
        let active = self.active.load(Ordering::Acquire);
        let acquisitions = self.stats.acquisitions.load(Ordering::Relaxed);
        let total_wait_us = self.stats.total_wait_us.load(Ordering::Relaxed);

        PoolStats {
            name: self.name.clone(),
            target: self.target.id.clone(),
            max_connections: self.config.max_connections,
            min_connections: self.config.min_connections,
            active_connections: active,
            idle_connections: idle,
            total_connections: total,
            total_created: self.stats.total_created.load(Ordering::Relaxed),
            total_reused: self.stats.total_reused.load(Ordering::Relaxed),
            failed_attempts: self.stats.failed_attempts.load(Ordering::Relaxed),
            exhausted_count: self.stats.exhausted_count.load(Ordering::Relaxed),
            total_closed: self.stats.total_closed.load(Ordering::Relaxed),
            total_wait_ms: total_wait_us / 1_000,
            avg_wait_ms: if acquisitions == 0 {
                0.0
            } else {
                total_wait_us as f64 / acquisitions as f64 / 1_000.0
            },
            utilization: active as f64 / self.config.max_connections.max(1) as f64,
        }
    }

    /// Connections in existence (active + idle + connects in flight)
    pub fn total_connections(&self) -> usize {
        self.state.lock().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::circuit::CircuitBreakerConfig;
    use crate::store::memory::MemoryStore;

    fn pool_with(store: Arc<MemoryStore>, config: PoolConfig) -> Arc<TargetPool> {
        let target = Target::new("primary", "mem://primary");
        let breaker = Arc::new(CircuitBreaker::new("primary", CircuitBreakerConfig::default()));
        TargetPool::new("primary", target, store, breaker, config, EventBus::default())
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_connections: 4,
            min_connections: 2,
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_warm_up_to_min() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(Arc::clone(&store), small_config());

        assert_eq!(pool.warm_up().await, 2);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_created, 2);
        assert_eq!(store.target("primary").open_connections(), 2);
    }

    #[tokio::test]
    async fn test_reuse_after_release() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(Arc::clone(&store), small_config());
        let cancel = CancellationToken::new();

        let conn = pool.acquire(&cancel, None).await.unwrap();
        assert_eq!(pool.stats().active_connections, 1);
        conn.release();

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);

        let _conn = pool.acquire(&cancel, None).await.unwrap();
        assert_eq!(pool.stats().total_reused, 1);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_bounded_wait() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(store, small_config());
        let cancel = CancellationToken::new();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(&cancel, None).await.unwrap());
        }

        let err = pool.acquire(&cancel, None).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert_eq!(pool.stats().exhausted_count, 1);
        assert!(pool.total_connections() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_connection_failed() {
        let store = Arc::new(MemoryStore::new());
        store.target("primary").set_reachable(false);
        let pool = pool_with(Arc::clone(&store), small_config());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let err = pool.acquire(&cancel, None).await.unwrap_err();

        assert!(matches!(err, PoolError::ConnectionFailed { attempts: 4, .. }));
        // 1s + 2s + 4s of backoff
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(store.target("primary").connect_attempts(), 4);
        assert_eq!(pool.total_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retries() {
        let store = Arc::new(MemoryStore::new());
        store.target("primary").fail_next_connects(2);
        let pool = pool_with(Arc::clone(&store), small_config());
        let cancel = CancellationToken::new();

        let conn = pool.acquire(&cancel, None).await;
        assert!(conn.is_ok());
        assert_eq!(pool.stats().failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_attempts() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(Arc::clone(&store), small_config());
        for _ in 0..10 {
            pool.breaker().record_failure(Admission::Normal);
        }

        let cancel = CancellationToken::new();
        let err = pool.acquire(&cancel, None).await.unwrap_err();
        assert!(matches!(err, PoolError::Circuit(_)));
        assert_eq!(store.target("primary").connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_closes_evicted_idle_connection() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            Arc::clone(&store),
            PoolConfig {
                max_connections: 1,
                min_connections: 1,
                ..small_config()
            },
        );
        assert_eq!(pool.warm_up().await, 1);
        for _ in 0..10 {
            pool.breaker().record_failure(Admission::Normal);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let cancel = CancellationToken::new();
        let _conn = pool.acquire(&cancel, None).await.unwrap();

        let primary = store.target("primary");
        assert!(pool.breaker().is_healthy());
        assert_eq!(primary.connect_attempts(), 2);
        assert_eq!(primary.closed_connections(), 1);
        assert_eq!(primary.open_connections(), 1);
        assert_eq!(pool.total_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_does_not_settle_trial() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(store, small_config());
        let cancel = CancellationToken::new();

        // Checked out while the circuit was still closed
        let straggler = pool.acquire(&cancel, None).await.unwrap();
        for _ in 0..10 {
            pool.breaker().record_failure(Admission::Normal);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = pool.breaker().check_request().unwrap();
        assert!(trial.is_trial());

        straggler.report_success();
        assert_eq!(pool.breaker().state().name(), "HalfOpen");

        pool.breaker().record_success(trial);
        assert!(pool.breaker().is_healthy());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaks_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.target("primary").set_connect_delay(Duration::from_secs(60));
        let pool = pool_with(Arc::clone(&store), small_config());
        let cancel = CancellationToken::new();

        let p = Arc::clone(&pool);
        let c = cancel.clone();
        let handle = tokio::spawn(async move { p.acquire(&c, None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::Cancelled)));
        assert_eq!(pool.total_connections(), 0);
        assert_eq!(pool.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let store = Arc::new(MemoryStore::new());
        store.target("primary").set_connect_delay(Duration::from_secs(60));
        let pool = pool_with(store, small_config());
        let cancel = CancellationToken::new();

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = pool.acquire(&cancel, Some(deadline)).await.unwrap_err();
        assert!(matches!(err, PoolError::DeadlineExceeded));
        assert_eq!(pool.total_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_respects_min() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(Arc::clone(&store), small_config());
        let cancel = CancellationToken::new();

        let held: Vec<_> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(pool.acquire(&cancel, None).await.unwrap());
            }
            v
        };
        drop(held);
        assert_eq!(pool.stats().idle_connections, 4);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.reap_idle().await, 2);

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(pool.total_connections(), 2);
        assert_eq!(store.target("primary").open_connections(), 2);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(store, small_config());
        let cancel = CancellationToken::new();

        let mut conn = pool.acquire(&cancel, None).await.unwrap();
        conn.mark_broken();
        drop(conn);

        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(pool.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(Arc::clone(&store), small_config());
        pool.warm_up().await;

        pool.shutdown().await;
        assert_eq!(store.target("primary").open_connections(), 0);

        let cancel = CancellationToken::new();
        let err = pool.acquire(&cancel, None).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed(_)));
    }

    #[test]
    fn test_backoff_schedule() {
        let config = PoolConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
    }
}
