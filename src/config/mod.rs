use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::lb::{Algorithm, HealthCheckConfig, LoadBalancerConfig};
use crate::pool::{CircuitBreakerConfig, PoolConfig};
use crate::ratelimit::RateLimitConfig;
use crate::store::Target;

/// A store target as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Stable identifier used in logs, stats and events
    pub id: String,

    /// Connection URL handed to the data store
    pub url: String,
}

impl TargetConfig {
    pub fn to_target(&self) -> Target {
        Target::new(self.id.clone(), self.url.clone())
    }
}

/// Connection pool settings, shared by every target's pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Bounded wait for a free connection, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are closed, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Reaper period in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,

    /// Timeout for one connection attempt in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds, doubled per retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_utilization_warn_threshold")]
    pub utilization_warn_threshold: f64,

    /// Connections reserved for critical reads on the primary
    #[serde(default = "default_priority_pool_size")]
    pub priority_pool_size: usize,
}

fn default_max_connections() -> usize {
    50
}

fn default_min_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_utilization_warn_threshold() -> f64 {
    0.8
}

fn default_priority_pool_size() -> usize {
    5
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
            connect_timeout: default_connect_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            utilization_warn_threshold: default_utilization_warn_threshold(),
            priority_pool_size: default_priority_pool_size(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            reap_interval: Duration::from_secs(self.reap_interval),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            utilization_warn_threshold: self.utilization_warn_threshold,
        }
    }
}

/// Circuit breaker settings, one breaker per target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_minimum_samples")]
    pub minimum_samples: usize,

    /// Rolling window in seconds
    #[serde(default = "default_window")]
    pub window: u64,

    /// Seconds the circuit stays open before a trial
    #[serde(default = "default_open_duration")]
    pub open_duration: u64,
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_minimum_samples() -> usize {
    10
}

fn default_window() -> u64 {
    60
}

fn default_open_duration() -> u64 {
    30
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_samples: default_minimum_samples(),
            window: default_window(),
            open_duration: default_open_duration(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: self.failure_rate_threshold,
            minimum_samples: self.minimum_samples,
            window: Duration::from_secs(self.window),
            open_duration: Duration::from_secs(self.open_duration),
        }
    }
}

/// Health probing and failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Probe period in seconds
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_lag_alert_ms")]
    pub lag_alert_threshold_ms: u64,

    #[serde(default = "default_lag_recovery_ms")]
    pub lag_recovery_threshold_ms: u64,

    /// Seconds from primary loss to completed promotion
    #[serde(default = "default_failover_deadline")]
    pub failover_deadline: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_lag_alert_ms() -> u64 {
    5_000
}

fn default_lag_recovery_ms() -> u64 {
    2_000
}

fn default_failover_deadline() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    1
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval: default_health_interval(),
            probe_timeout_ms: default_probe_timeout_ms(),
            lag_alert_threshold_ms: default_lag_alert_ms(),
            lag_recovery_threshold_ms: default_lag_recovery_ms(),
            failover_deadline: default_failover_deadline(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: self.enabled,
            interval: Duration::from_secs(self.interval),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            lag_alert_threshold: Duration::from_millis(self.lag_alert_threshold_ms),
            lag_recovery_threshold: Duration::from_millis(self.lag_recovery_threshold_ms),
            failover_deadline: Duration::from_secs(self.failover_deadline),
            failure_threshold: self.failure_threshold,
            ..Default::default()
        }
    }

    pub fn lag_threshold(&self) -> Duration {
        Duration::from_millis(self.lag_alert_threshold_ms)
    }
}

/// Replica selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSection {
    /// weighted_round_robin, round_robin, least_connections, power_of_two
    #[serde(default)]
    pub strategy: Algorithm,

    #[serde(default = "default_cpu_share")]
    pub cpu_share: f64,

    #[serde(default = "default_response_time_ceiling_ms")]
    pub response_time_ceiling_ms: f64,

    #[serde(default = "default_high_cpu_threshold")]
    pub high_cpu_threshold: f64,
}

fn default_cpu_share() -> f64 {
    0.5
}

fn default_response_time_ceiling_ms() -> f64 {
    1_000.0
}

fn default_high_cpu_threshold() -> f64 {
    80.0
}

impl Default for LoadBalancerSection {
    fn default() -> Self {
        Self {
            strategy: Algorithm::default(),
            cpu_share: default_cpu_share(),
            response_time_ceiling_ms: default_response_time_ceiling_ms(),
            high_cpu_threshold: default_high_cpu_threshold(),
        }
    }
}

impl LoadBalancerSection {
    pub fn to_balancer_config(&self) -> LoadBalancerConfig {
        LoadBalancerConfig {
            algorithm: self.strategy,
            cpu_share: self.cpu_share,
            response_time_ceiling_ms: self.response_time_ceiling_ms,
            high_cpu_threshold: self.high_cpu_threshold,
            ..Default::default()
        }
    }
}

/// Two-tier cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Seconds
    #[serde(default = "default_l1_ttl")]
    pub l1_ttl: u64,

    /// Seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: u64,

    /// Seconds a key stays tombstoned after a failed invalidation
    #[serde(default = "default_fallback_ttl")]
    pub fallback_ttl: u64,

    #[serde(default = "default_l2_timeout_ms")]
    pub l2_timeout_ms: u64,
}

fn default_l1_capacity() -> usize {
    1000
}

fn default_l1_ttl() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_fallback_ttl() -> u64 {
    30
}

fn default_l2_timeout_ms() -> u64 {
    1_000
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l1_ttl: default_l1_ttl(),
            default_ttl: default_cache_ttl(),
            fallback_ttl: default_fallback_ttl(),
            l2_timeout_ms: default_l2_timeout_ms(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            l1_capacity: self.l1_capacity,
            l1_ttl: Duration::from_secs(self.l1_ttl),
            default_ttl: Duration::from_secs(self.default_ttl),
            fallback_ttl: Duration::from_secs(self.fallback_ttl),
            l2_timeout: Duration::from_millis(self.l2_timeout_ms),
        }
    }
}

/// Admission control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_per_identity_limit")]
    pub per_identity_limit: u32,

    #[serde(default = "default_global_limit")]
    pub global_limit: u32,

    /// Window length in seconds
    #[serde(default = "default_rate_window")]
    pub window: u64,

    /// Identities that bypass both limits
    #[serde(default)]
    pub admin_identities: Vec<String>,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_per_identity_limit() -> u32 {
    100
}

fn default_global_limit() -> u32 {
    10_000
}

fn default_rate_window() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            per_identity_limit: default_per_identity_limit(),
            global_limit: default_global_limit(),
            window: default_rate_window(),
            admin_identities: Vec::new(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl RateLimitSection {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_identity_limit: self.per_identity_limit,
            global_limit: self.global_limit,
            window: Duration::from_secs(self.window),
            admin_identities: self.admin_identities.clone(),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }
}

/// Event channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    /// Events buffered per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The write target at startup
    pub primary: TargetConfig,

    /// Read replicas
    #[serde(default)]
    pub replicas: Vec<TargetConfig>,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub load_balancer: LoadBalancerSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub events: EventsSection,
}

impl Config {
    /// Configuration with default settings for the given targets
    pub fn new(primary: TargetConfig, replicas: Vec<TargetConfig>) -> Self {
        Self {
            primary,
            replicas,
            pool: PoolSection::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            health: HealthSection::default(),
            load_balancer: LoadBalancerSection::default(),
            cache: CacheSection::default(),
            rate_limit: RateLimitSection::default(),
            events: EventsSection::default(),
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.primary.url.trim().is_empty() {
            anyhow::bail!("primary.url must not be empty");
        }

        let mut ids = HashSet::new();
        for target in std::iter::once(&self.primary).chain(&self.replicas) {
            if target.id.trim().is_empty() {
                anyhow::bail!("target ids must not be empty");
            }
            if !ids.insert(target.id.as_str()) {
                anyhow::bail!("duplicate target id '{}'", target.id);
            }
        }

        let pool = &self.pool;
        if pool.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be at least 1");
        }
        if pool.min_connections > pool.max_connections {
            anyhow::bail!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                pool.min_connections,
                pool.max_connections
            );
        }
        if pool.priority_pool_size == 0 {
            anyhow::bail!("pool.priority_pool_size must be at least 1");
        }
        check_fraction("pool.utilization_warn_threshold", pool.utilization_warn_threshold)?;
        check_fraction(
            "circuit_breaker.failure_rate_threshold",
            self.circuit_breaker.failure_rate_threshold,
        )?;
        if self.circuit_breaker.window == 0 {
            anyhow::bail!("circuit_breaker.window must be positive");
        }

        let health = &self.health;
        if health.interval == 0 {
            anyhow::bail!("health.interval must be positive");
        }
        if health.lag_recovery_threshold_ms >= health.lag_alert_threshold_ms {
            anyhow::bail!("health.lag_recovery_threshold_ms must be below health.lag_alert_threshold_ms");
        }
        if health.failure_threshold == 0 {
            anyhow::bail!("health.failure_threshold must be at least 1");
        }

        check_fraction("load_balancer.cpu_share", self.load_balancer.cpu_share)?;

        if self.cache.l1_capacity == 0 {
            anyhow::bail!("cache.l1_capacity must be at least 1");
        }
        if self.cache.fallback_ttl > 30 {
            anyhow::bail!("cache.fallback_ttl must not exceed 30 seconds");
        }

        let limits = &self.rate_limit;
        if limits.per_identity_limit == 0 || limits.global_limit == 0 {
            anyhow::bail!("rate limits must be at least 1");
        }
        if limits.window == 0 {
            anyhow::bail!("rate_limit.window must be positive");
        }

        Ok(())
    }

    pub fn targets(&self) -> (Target, Vec<Target>) {
        (
            self.primary.to_target(),
            self.replicas.iter().map(TargetConfig::to_target).collect(),
        )
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        anyhow::bail!("{} must be in (0, 1], got {}", name, value);
    }
    Ok(())
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Parse an optional environment variable
fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .context(format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Load configuration from environment variables
///
/// - DBPOOL_PRIMARY_URL (required), DBPOOL_PRIMARY_ID (default `primary`)
/// - DBPOOL_REPLICAS: comma-separated `id=url` or bare urls (named
///   `replica-1`, `replica-2`, ...)
/// - DBPOOL_POOL_MAX, DBPOOL_POOL_MIN, DBPOOL_ACQUIRE_TIMEOUT_MS,
///   DBPOOL_PRIORITY_POOL_SIZE
/// - DBPOOL_LB_STRATEGY, DBPOOL_HEALTH_INTERVAL
/// - DBPOOL_CACHE_CAPACITY
/// - DBPOOL_RATE_LIMIT, DBPOOL_GLOBAL_RATE_LIMIT, DBPOOL_ADMIN_IDENTITIES
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let url = std::env::var("DBPOOL_PRIMARY_URL")
        .context("DBPOOL_PRIMARY_URL environment variable not set")?;
    let id = std::env::var("DBPOOL_PRIMARY_ID").unwrap_or_else(|_| "primary".to_string());

    let replicas = env_list("DBPOOL_REPLICAS")
        .into_iter()
        .enumerate()
        .map(|(i, entry)| match entry.split_once('=') {
            Some((id, url)) => TargetConfig {
                id: id.trim().to_string(),
                url: url.trim().to_string(),
            },
            None => TargetConfig {
                id: format!("replica-{}", i + 1),
                url: entry,
            },
        })
        .collect();

    let mut config = Config::new(TargetConfig { id, url }, replicas);

    if let Some(max) = env_var("DBPOOL_POOL_MAX")? {
        config.pool.max_connections = max;
    }
    if let Some(min) = env_var("DBPOOL_POOL_MIN")? {
        config.pool.min_connections = min;
    }
    if let Some(timeout) = env_var("DBPOOL_ACQUIRE_TIMEOUT_MS")? {
        config.pool.acquire_timeout_ms = timeout;
    }
    if let Some(size) = env_var("DBPOOL_PRIORITY_POOL_SIZE")? {
        config.pool.priority_pool_size = size;
    }
    if let Ok(strategy) = std::env::var("DBPOOL_LB_STRATEGY") {
        config.load_balancer.strategy = serde_yaml::from_str(&strategy)
            .context(format!("Unknown load balancer strategy: {}", strategy))?;
    }
    if let Some(interval) = env_var("DBPOOL_HEALTH_INTERVAL")? {
        config.health.interval = interval;
    }
    if let Some(capacity) = env_var("DBPOOL_CACHE_CAPACITY")? {
        config.cache.l1_capacity = capacity;
    }
    if let Some(limit) = env_var("DBPOOL_RATE_LIMIT")? {
        config.rate_limit.per_identity_limit = limit;
    }
    if let Some(limit) = env_var("DBPOOL_GLOBAL_RATE_LIMIT")? {
        config.rate_limit.global_limit = limit;
    }
    let admins = env_list("DBPOOL_ADMIN_IDENTITIES");
    if !admins.is_empty() {
        config.rate_limit.admin_identities = admins;
    }

    Ok(config)
}

/// Load configuration from file or environment, then validate it
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
