//! dbpool - resilience and performance layer for database access
//!
//! Sits between request handlers and a primary store, its read replicas and
//! a distributed cache. Pools connections per target behind circuit
//! breakers, routes reads across healthy replicas, fails over a dead
//! primary, caches in two tiers and rate-limits callers. Everything hangs
//! off one [`ResiliencePool`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod isolation;
pub mod lb;
pub mod pool;
pub mod ratelimit;
pub mod store;

pub use crate::core::{RequestContext, ResiliencePool, ResilienceStats};
pub use config::Config;
pub use error::ResilienceError;
pub use events::{EventBus, ResilienceEvent, Severity};
