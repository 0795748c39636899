use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::SetOptions;
use crate::config::Config;
use crate::core::{RequestContext, ResiliencePool, ResilienceStats};
use crate::error::ResilienceError;
use crate::store::memory::{MemoryCache, MemoryStore};
use crate::store::{DataStore, DistributedCache, Invalidation, Priority, Query};

/// Print a human-readable summary of a validated configuration
pub fn cmd_validate(config: &Config) -> Result<()> {
    config.validate()?;

    println!("Configuration OK");
    println!("  primary:   {} ({})", config.primary.id, config.primary.url);
    for replica in &config.replicas {
        println!("  replica:   {} ({})", replica.id, replica.url);
    }
    println!(
        "  pool:      {}-{} connections per target, {} reserved for critical reads",
        config.pool.min_connections, config.pool.max_connections, config.pool.priority_pool_size
    );
    println!(
        "  breaker:   opens at {:.0}% failures over {}s (min {} samples), {}s cool-down",
        config.circuit_breaker.failure_rate_threshold * 100.0,
        config.circuit_breaker.window,
        config.circuit_breaker.minimum_samples,
        config.circuit_breaker.open_duration
    );
    println!(
        "  health:    {} every {}s, lag alert {}ms, failover within {}s",
        if config.health.enabled { "probing" } else { "disabled" },
        config.health.interval,
        config.health.lag_alert_threshold_ms,
        config.health.failover_deadline
    );
    println!("  balancer:  {:?}", config.load_balancer.strategy);
    println!(
        "  cache:     {} L1 entries, default TTL {}s",
        config.cache.l1_capacity, config.cache.default_ttl
    );
    println!(
        "  limits:    {} per identity, {} global per {}s",
        config.rate_limit.per_identity_limit, config.rate_limit.global_limit, config.rate_limit.window
    );

    Ok(())
}

/// Options for the `simulate` command
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub requests: usize,
    pub concurrency: usize,
    pub identities: usize,
    /// Take the primary down once this many requests have been issued
    pub fail_primary_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Outcomes {
    succeeded: u64,
    rate_limited: u64,
    failed: BTreeMap<String, u64>,
}

/// Result of a simulation run
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    pub concurrency: usize,
    pub elapsed_ms: u64,
    pub succeeded: u64,
    pub rate_limited: u64,
    pub failed: BTreeMap<String, u64>,
    pub events: BTreeMap<String, u64>,
    pub stats: ResilienceStats,
}

/// Drive a mixed read/write workload through a pool backed by in-memory
/// stores and print the report as JSON
pub async fn cmd_simulate(config: Config, options: SimulateOptions) -> Result<()> {
    let report = run_simulation(config, options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn run_simulation(config: Config, options: SimulateOptions) -> Result<SimulationReport> {
    let primary_id = config.primary.id.clone();
    let store = Arc::new(MemoryStore::new());
    let l2 = Arc::new(MemoryCache::new());
    let pool = ResiliencePool::new(
        config,
        Arc::clone(&store) as Arc<dyn DataStore>,
        Some(l2 as Arc<dyn DistributedCache>),
    )?;

    let mut events = pool.subscribe();
    let stop_counting = CancellationToken::new();
    let stop = stop_counting.clone();
    let event_counts = tokio::spawn(async move {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => *counts.entry(event.name().to_string()).or_default() += 1,
                    Err(RecvError::Lagged(n)) => *counts.entry("lagged".to_string()).or_default() += n,
                    Err(RecvError::Closed) => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        *counts.entry(event.name().to_string()).or_default() += 1;
                    }
                    break;
                }
            }
        }
        counts
    });

    pool.start().await;
    info!(
        requests = options.requests,
        concurrency = options.concurrency,
        "Starting simulation"
    );

    let issued = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut workers = JoinSet::new();

    for worker in 0..options.concurrency.max(1) {
        let pool = pool.clone();
        let store = Arc::clone(&store);
        let issued = Arc::clone(&issued);
        let options = options.clone();
        let primary_id = primary_id.clone();

        workers.spawn(async move {
            let mut outcomes = Outcomes::default();
            let ctx = RequestContext::new(format!("client-{}", worker % options.identities.max(1)));

            loop {
                let n = issued.fetch_add(1, Ordering::Relaxed);
                if n >= options.requests {
                    break;
                }

                if options.fail_primary_after == Some(n) {
                    warn!(primary = %primary_id, request = n, "Taking primary down");
                    store.target(&primary_id).set_reachable(false);
                    pool.health.check_now().await;
                }

                match one_request(&pool, &ctx, n).await {
                    Ok(()) => outcomes.succeeded += 1,
                    Err(ResilienceError::RateLimited { .. }) => outcomes.rate_limited += 1,
                    Err(e) => *outcomes.failed.entry(error_kind(&e).to_string()).or_default() += 1,
                }
            }
            outcomes
        });
    }

    let mut total = Outcomes::default();
    while let Some(joined) = workers.join_next().await {
        let outcomes = joined?;
        total.succeeded += outcomes.succeeded;
        total.rate_limited += outcomes.rate_limited;
        for (kind, count) in outcomes.failed {
            *total.failed.entry(kind).or_default() += count;
        }
    }
    let elapsed = start.elapsed();

    let stats = pool.stats();
    pool.shutdown().await;
    stop_counting.cancel();
    let events = event_counts.await?;

    Ok(SimulationReport {
        requests: options.requests,
        concurrency: options.concurrency,
        elapsed_ms: elapsed.as_millis() as u64,
        succeeded: total.succeeded,
        rate_limited: total.rate_limited,
        failed: total.failed,
        events,
        stats,
    })
}

/// Every fifth request writes and invalidates the item tag; one read in ten
/// is critical; the rest are cached reads over a small key space.
async fn one_request(pool: &ResiliencePool, ctx: &RequestContext, n: usize) -> Result<(), ResilienceError> {
    let item = n % 50;
    if n % 5 == 0 {
        let query = Query::write(format!("UPDATE items SET touched = now() WHERE id = {}", item))
            .invalidating(Invalidation::Tag("items".to_string()));
        pool.write(ctx, &query).await?;
    } else if n % 10 == 1 {
        let query = Query::read(format!("SELECT * FROM items WHERE id = {}", item))
            .with_priority(Priority::Critical);
        pool.read(ctx, &query).await?;
    } else {
        let query = Query::read(format!("SELECT * FROM items WHERE id = {}", item));
        let _: Vec<serde_json::Value> = pool
            .cached_read(ctx, &format!("item:{}", item), &query, SetOptions::default().tag("items"))
            .await?;
    }
    Ok(())
}

fn error_kind(err: &ResilienceError) -> &'static str {
    match err {
        ResilienceError::PoolExhausted { .. } => "pool_exhausted",
        ResilienceError::ConnectionFailed { .. } => "connection_failed",
        ResilienceError::CircuitOpen { .. } => "circuit_open",
        ResilienceError::RateLimited { .. } => "rate_limited",
        ResilienceError::CacheUnavailable(_) => "cache_unavailable",
        ResilienceError::ReplicaLagExceeded { .. } => "replica_lag_exceeded",
        ResilienceError::FailoverTimeout { .. } => "failover_timeout",
        ResilienceError::NoFailoverCandidate(_) => "no_failover_candidate",
        ResilienceError::UnknownTarget(_) => "unknown_target",
        ResilienceError::PoolClosed(_) => "pool_closed",
        ResilienceError::QueryKindMismatch { .. } => "query_kind_mismatch",
        ResilienceError::Cancelled => "cancelled",
        ResilienceError::DeadlineExceeded => "deadline_exceeded",
        ResilienceError::Store(_) => "store",
        ResilienceError::Serialization(_) => "serialization",
    }
}
