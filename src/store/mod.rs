//! Interfaces to the external data store and distributed cache
//!
//! The resilience layer never talks to a real database or cache cluster
//! itself. Callers supply implementations of [`DataStore`] and
//! [`DistributedCache`]; this module defines those seams plus the value
//! types that cross them.
//!
//! [`memory`] contains in-process implementations used by the test suite
//! and the `simulate` command.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a store target (the primary or one replica)
pub type TargetId = String;

/// A connectable store target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier used in logs, stats and events
    pub id: TargetId,

    /// Connection URL handed to the data store implementation
    pub url: String,
}

impl Target {
    pub fn new(id: impl Into<TargetId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Whether a statement reads or mutates data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Read,
    Write,
}

/// Priority hint attached by the upstream query analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Critical,
}

/// Cache entries a write makes stale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    Key(String),
    Tag(String),
    Pattern(String),
}

/// A statement plus the routing hints the layer acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,

    #[serde(default)]
    pub params: Vec<serde_json::Value>,

    pub kind: QueryKind,

    #[serde(default)]
    pub priority: Priority,

    /// Cache entries to drop once a write has committed
    #[serde(default)]
    pub invalidates: Vec<Invalidation>,
}

impl Query {
    pub fn read(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            kind: QueryKind::Read,
            priority: Priority::Normal,
            invalidates: Vec::new(),
        }
    }

    pub fn write(sql: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Write,
            ..Self::read(sql)
        }
    }

    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn invalidating(mut self, invalidation: Invalidation) -> Self {
        self.invalidates.push(invalidation);
        self
    }

    pub fn is_write(&self) -> bool {
        self.kind == QueryKind::Write
    }
}

/// Rows returned by a read, one JSON object per row
pub type Rows = Vec<serde_json::Value>;

/// Result of a committed write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub rows_affected: u64,
}

/// Liveness and load figures reported by a single probe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// Round-trip time of the probe
    pub latency: Duration,

    /// CPU utilization in percent (0-100)
    pub cpu_utilization: f64,

    /// Replication lag, only meaningful for replicas
    pub replication_lag: Option<Duration>,

    /// Memory utilization in percent, if the store exposes it
    pub memory_utilization: Option<f64>,

    /// Disk utilization in percent, if the store exposes it
    pub disk_utilization: Option<f64>,
}

/// Errors raised by store and cache implementations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write attempted on read-only target: {0}")]
    ReadOnly(String),
}

impl StoreError {
    /// Connection-level failures count against the target's circuit breaker;
    /// query errors (bad SQL, constraint violations) do not.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StoreError::Unreachable(_) | StoreError::ConnectionLost(_) | StoreError::Timeout(_)
        )
    }
}

/// One live connection handle to a store target
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn execute_read(&mut self, query: &Query) -> Result<Rows, StoreError>;

    async fn execute_write(&mut self, query: &Query) -> Result<WriteOutcome, StoreError>;

    /// Cheap validity check run before an idle connection is handed out
    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Data store collaborator: opens connections, probes and promotes targets
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn StoreConnection>, StoreError>;

    async fn ping(&self, target: &Target) -> Result<ProbeReport, StoreError>;

    /// Promote a replica to accept writes. Stores that promote out of band
    /// (managed failover) can keep the default.
    async fn promote(&self, target: &Target) -> Result<(), StoreError> {
        let _ = target;
        Ok(())
    }
}

/// A value read from the distributed cache with the tags it was stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedValue {
    pub value: Bytes,
    pub tags: Vec<String>,
}

/// Distributed (L2) cache collaborator
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Tags must come back with the value so a local copy can be found by
    /// tag while the distributed tier is unreachable.
    async fn get(&self, key: &str) -> Result<Option<TaggedValue>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Shorten the remaining lifetime of an entry
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn scan_by_tag(&self, tag: &str) -> Result<Vec<String>, StoreError>;

    /// Keys matching a glob (`*`, `?`)
    async fn scan_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}
