//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Bounded per-target connection pools with pre-warming and idle reaping
//! - Circuit breaker pattern for fault tolerance
//! - A manager routing acquires to the primary, replica and priority pools

pub mod circuit;
pub mod connection;
pub mod manager;

pub use circuit::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
};
pub use connection::{PoolConfig, PoolError, PoolStats, PooledConnection, TargetPool};
pub use manager::{BreakerStats, ConnectionPoolManager, ManagerStats, RoutedConnection};
