//! In-process store and cache implementations
//!
//! [`MemoryStore`] and [`MemoryCache`] stand in for the external
//! collaborators. Every target and the cache can be switched unreachable at
//! runtime, and per-target counters record how many connection attempts and
//! queries actually reached them.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{
    DataStore, DistributedCache, ProbeReport, Query, Rows, StoreConnection, StoreError, TaggedValue,
    Target, TargetId, WriteOutcome,
};
use crate::cache::GlobPattern;

/// Mutable simulation knobs and counters for one target
#[derive(Debug)]
pub struct TargetState {
    reachable: AtomicBool,
    read_only: AtomicBool,
    /// Number of upcoming connect calls that fail even while reachable
    failing_connects: AtomicU32,
    /// CPU percent * 100
    cpu_centi: AtomicU32,
    lag_ms: AtomicU64,
    latency_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    query_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,

    connect_attempts: AtomicU64,
    open_connections: AtomicU64,
    closed_connections: AtomicU64,
    reads_served: AtomicU64,
    writes_served: AtomicU64,
    promotions: AtomicU64,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            read_only: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            cpu_centi: AtomicU32::new(2_000),
            lag_ms: AtomicU64::new(0),
            latency_ms: AtomicU64::new(1),
            connect_delay_ms: AtomicU64::new(0),
            query_delay_ms: AtomicU64::new(0),
            close_delay_ms: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            open_connections: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            reads_served: AtomicU64::new(0),
            writes_served: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
        }
    }
}

impl TargetState {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn set_cpu(&self, percent: f64) {
        self.cpu_centi
            .store((percent.clamp(0.0, 100.0) * 100.0) as u32, Ordering::SeqCst);
    }

    pub fn set_lag(&self, lag: Duration) {
        self.lag_ms.store(lag.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay applied to every read and write
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay before a graceful close completes
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn query_delay(&self) {
        let delay = self.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Connections shut down through `close` rather than dropped
    pub fn closed_connections(&self) -> u64 {
        self.closed_connections.load(Ordering::SeqCst)
    }

    pub fn reads_served(&self) -> u64 {
        self.reads_served.load(Ordering::SeqCst)
    }

    pub fn writes_served(&self) -> u64 {
        self.writes_served.load(Ordering::SeqCst)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::SeqCst)
    }
}

/// In-memory [`DataStore`] with per-target failure injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    targets: RwLock<HashMap<TargetId, Arc<TargetState>>>,
    promote_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or lazily create) the simulation state of a target
    pub fn target(&self, id: &str) -> Arc<TargetState> {
        if let Some(state) = self.targets.read().get(id) {
            return Arc::clone(state);
        }
        let mut targets = self.targets.write();
        Arc::clone(targets.entry(id.to_string()).or_default())
    }

    /// Delay applied to every `promote` call
    pub fn set_promote_delay(&self, delay: Duration) {
        self.promote_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn connect(&self, target: &Target) -> Result<Box<dyn StoreConnection>, StoreError> {
        let state = self.target(&target.id);
        state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !state.is_reachable() {
            return Err(StoreError::Unreachable(target.id.clone()));
        }

        let failing = state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::ConnectionLost(format!(
                "injected connect failure for {}",
                target.id
            )));
        }

        state.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(target_id = %target.id, "memory store connection opened");

        Ok(Box::new(MemoryConnection {
            target: target.id.clone(),
            state,
            closed: false,
        }))
    }

    async fn ping(&self, target: &Target) -> Result<ProbeReport, StoreError> {
        let state = self.target(&target.id);
        if !state.is_reachable() {
            return Err(StoreError::Unreachable(target.id.clone()));
        }

        Ok(ProbeReport {
            latency: Duration::from_millis(state.latency_ms.load(Ordering::SeqCst)),
            cpu_utilization: state.cpu_centi.load(Ordering::SeqCst) as f64 / 100.0,
            replication_lag: Some(Duration::from_millis(state.lag_ms.load(Ordering::SeqCst))),
            memory_utilization: None,
            disk_utilization: None,
        })
    }

    async fn promote(&self, target: &Target) -> Result<(), StoreError> {
        let delay = self.promote_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let state = self.target(&target.id);
        if !state.is_reachable() {
            return Err(StoreError::Unreachable(target.id.clone()));
        }
        state.set_read_only(false);
        state.set_lag(Duration::ZERO);
        state.promotions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConnection {
    target: TargetId,
    state: Arc<TargetState>,
    closed: bool,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn execute_read(&mut self, query: &Query) -> Result<Rows, StoreError> {
        self.state.query_delay().await;
        if !self.state.is_reachable() {
            return Err(StoreError::ConnectionLost(self.target.clone()));
        }
        self.state.reads_served.fetch_add(1, Ordering::SeqCst);
        Ok(vec![serde_json::json!({
            "target": self.target,
            "sql": query.sql,
        })])
    }

    async fn execute_write(&mut self, _query: &Query) -> Result<WriteOutcome, StoreError> {
        self.state.query_delay().await;
        if !self.state.is_reachable() {
            return Err(StoreError::ConnectionLost(self.target.clone()));
        }
        if self.state.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly(self.target.clone()));
        }
        self.state.writes_served.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome { rows_affected: 1 })
    }

    async fn is_valid(&self) -> bool {
        self.state.is_reachable()
    }

    async fn close(&mut self) {
        let delay = self.state.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.closed {
            self.closed = true;
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
            self.state.closed_connections.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Instant,
    tags: Vec<String>,
}

/// In-memory [`DistributedCache`] that can be switched unavailable
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
    operations: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of calls that reached the cache while available
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of a live entry, bypassing availability
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .and_then(|v| v.expires_at.checked_duration_since(Instant::now()))
    }

    /// Whether a live entry exists, bypassing availability
    pub fn contains(&self, key: &str) -> bool {
        self.ttl_of(key).is_some()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            self.operations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(StoreError::Unreachable("distributed cache".to_string()))
        }
    }

    fn live_keys<F>(&self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str, &StoredValue) -> bool,
    {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(k, v)| v.expires_at > now && keep(k, v))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<TaggedValue>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.expires_at > Instant::now() => Ok(Some(TaggedValue {
                value: v.value.clone(),
                tags: v.tags.clone(),
            })),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(v) = self.entries.lock().get_mut(key) {
            let new_expiry = Instant::now() + ttl;
            if new_expiry < v.expires_at {
                v.expires_at = new_expiry;
            }
        }
        Ok(())
    }

    async fn scan_by_tag(&self, tag: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self.live_keys(|_, v| v.tags.iter().any(|t| t == tag)))
    }

    async fn scan_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let glob = GlobPattern::new(pattern);
        Ok(self.live_keys(|k, _| glob.matches(k)))
    }
}
