//! Load balancing and health monitoring for store targets
//!
//! # Components
//!
//! - [`Endpoint`]: A store target with an atomically swapped health snapshot
//!   and connection tracking
//! - [`LoadBalancer`]: Distributes reads across healthy replicas
//! - [`HealthMonitor`]: Probes every target on a fixed period, tracks
//!   replication lag and drives failover when the primary goes away
//!
//! # Load Balancing Algorithms
//!
//! - **Weighted round-robin** (default): weights derived from CPU and
//!   response time, recomputed on every health tick
//! - **Round-robin**: Simple sequential distribution
//! - **Power-of-two**: Pick 2 random replicas, choose the one with fewer connections
//! - **Least-connections**: Always pick the replica with the fewest active connections
//!
//! When no replica is healthy, selection falls back to the primary.
//!
//! # Thread Safety
//!
//! Health snapshots are immutable and swapped with `arc-swap`, so the request
//! path reads them without locking. Each target's probe loop is the only
//! regular writer of its snapshot.

pub mod balancer;
pub mod endpoint;
pub mod health;

pub use balancer::{compute_weight, Algorithm, LoadBalancer, LoadBalancerConfig, Selection};
pub use endpoint::{Endpoint, EndpointHealth, EndpointStats, Role};
pub use health::{FailoverRecord, HealthCheckConfig, HealthMonitor, HealthStats};
