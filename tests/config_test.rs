use dbpool::lb::Algorithm;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
primary:
  id: db-main
  url: postgres://db-main:5432/app
replicas:
  - id: db-r1
    url: postgres://db-r1:5432/app
  - id: db-r2
    url: postgres://db-r2:5432/app

pool:
  max_connections: 30
  min_connections: 5
  acquire_timeout_ms: 2000

circuit_breaker:
  failure_rate_threshold: 0.4
  open_duration: 15

health:
  interval: 5
  failover_deadline: 20

load_balancer:
  strategy: power_of_two

cache:
  l1_capacity: 500

rate_limit:
  per_identity_limit: 50
  global_limit: 5000
  admin_identities:
    - ops
    - migrations
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("dbpool.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = dbpool::config::load_config(config_path.to_str()).unwrap();

    assert_eq!(config.primary.id, "db-main");
    assert_eq!(config.replicas.len(), 2);
    assert_eq!(config.replicas[1].url, "postgres://db-r2:5432/app");

    let pool = config.pool.to_pool_config();
    assert_eq!(pool.max_connections, 30);
    assert_eq!(pool.min_connections, 5);
    assert_eq!(pool.acquire_timeout, Duration::from_secs(2));

    let breaker = config.circuit_breaker.to_breaker_config();
    assert_eq!(breaker.failure_rate_threshold, 0.4);
    assert_eq!(breaker.open_duration, Duration::from_secs(15));

    let health = config.health.to_health_config();
    assert_eq!(health.interval, Duration::from_secs(5));
    assert_eq!(health.failover_deadline, Duration::from_secs(20));

    assert_eq!(config.load_balancer.strategy, Algorithm::PowerOfTwo);
    assert_eq!(config.cache.l1_capacity, 500);
    assert_eq!(config.rate_limit.admin_identities, vec!["ops", "migrations"]);
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    let vars = [
        "DBPOOL_PRIMARY_URL",
        "DBPOOL_PRIMARY_ID",
        "DBPOOL_REPLICAS",
        "DBPOOL_POOL_MAX",
        "DBPOOL_LB_STRATEGY",
        "DBPOOL_ADMIN_IDENTITIES",
    ];
    let saved: Vec<(&str, Option<String>)> = vars.iter().map(|v| (*v, env::var(v).ok())).collect();

    env::set_var("DBPOOL_PRIMARY_URL", "postgres://main/app");
    env::set_var("DBPOOL_PRIMARY_ID", "main");
    env::set_var("DBPOOL_REPLICAS", "east=postgres://east/app, postgres://west/app");
    env::set_var("DBPOOL_POOL_MAX", "20");
    env::set_var("DBPOOL_LB_STRATEGY", "least_connections");
    env::set_var("DBPOOL_ADMIN_IDENTITIES", "ops,backup");

    let config = dbpool::config::load_from_env().unwrap();

    assert_eq!(config.primary.id, "main");
    assert_eq!(config.primary.url, "postgres://main/app");
    assert_eq!(config.replicas.len(), 2);
    assert_eq!(config.replicas[0].id, "east");
    assert_eq!(config.replicas[0].url, "postgres://east/app");
    // Bare URLs are named by position
    assert_eq!(config.replicas[1].id, "replica-2");
    assert_eq!(config.pool.max_connections, 20);
    assert_eq!(config.pool.min_connections, 10);
    assert_eq!(config.load_balancer.strategy, Algorithm::LeastConnections);
    assert_eq!(config.rate_limit.admin_identities, vec!["ops", "backup"]);
    assert!(config.validate().is_ok());

    // A malformed number is reported, not ignored
    env::set_var("DBPOOL_POOL_MAX", "lots");
    let err = dbpool::config::load_from_env().unwrap_err();
    assert!(err.to_string().contains("DBPOOL_POOL_MAX"));

    for (key, value) in saved {
        cleanup_env(key, value);
    }
}

/// Test default values
#[test]
fn test_default_values() {
    let yaml = r#"
primary:
  id: primary
  url: postgres://primary
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("dbpool.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = dbpool::config::load_from_yaml(&config_path).unwrap();

    assert!(config.replicas.is_empty());
    assert_eq!(config.pool.max_connections, 50);
    assert_eq!(config.pool.min_connections, 10);
    assert_eq!(config.pool.idle_timeout, 300);
    assert_eq!(config.pool.max_retries, 3);
    assert_eq!(config.pool.priority_pool_size, 5);
    assert_eq!(config.circuit_breaker.failure_rate_threshold, 0.5);
    assert_eq!(config.circuit_breaker.window, 60);
    assert_eq!(config.circuit_breaker.open_duration, 30);
    assert!(config.health.enabled);
    assert_eq!(config.health.lag_alert_threshold_ms, 5_000);
    assert_eq!(config.health.failover_deadline, 30);
    assert_eq!(config.load_balancer.strategy, Algorithm::WeightedRoundRobin);
    assert_eq!(config.cache.default_ttl, 300);
    assert_eq!(config.rate_limit.per_identity_limit, 100);
    assert_eq!(config.rate_limit.window, 60);
}

/// Invalid files fail to load with context
#[test]
fn test_invalid_config_rejected() {
    let yaml = r#"
primary:
  id: primary
  url: postgres://primary
replicas:
  - id: primary
    url: postgres://copy
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("dbpool.yaml");
    fs::write(&config_path, yaml).unwrap();

    let err = dbpool::config::load_config(config_path.to_str()).unwrap_err();
    assert!(format!("{:#}", err).contains("duplicate target id"));

    let missing = temp_dir.path().join("missing.yaml");
    assert!(dbpool::config::load_from_yaml(&missing).is_err());

    fs::write(&config_path, "primary: [not, a, target]").unwrap();
    assert!(dbpool::config::load_from_yaml(&config_path).is_err());
}

/// Helper function to cleanup environment variables
fn cleanup_env(key: &str, orig_val: Option<String>) {
    match orig_val {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
