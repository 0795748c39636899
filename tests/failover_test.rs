//! Primary loss, replica promotion and read continuity

use dbpool::config::{Config, TargetConfig};
use dbpool::lb::Role;
use dbpool::store::memory::MemoryStore;
use dbpool::store::{DataStore, Query};
use dbpool::{RequestContext, ResilienceError, ResilienceEvent, ResiliencePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> Config {
    let mut config = Config::new(
        TargetConfig {
            id: "primary".to_string(),
            url: "mem://primary".to_string(),
        },
        vec![
            TargetConfig {
                id: "replica-1".to_string(),
                url: "mem://replica-1".to_string(),
            },
            TargetConfig {
                id: "replica-2".to_string(),
                url: "mem://replica-2".to_string(),
            },
        ],
    );
    config.pool.min_connections = 1;
    config.pool.max_connections = 8;
    config.pool.priority_pool_size = 2;
    config.health.interval = 1;
    config.rate_limit.per_identity_limit = 10_000;
    config
}

fn pool_with(config: Config) -> (ResiliencePool, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pool = ResiliencePool::new(config, Arc::clone(&store) as Arc<dyn DataStore>, None).unwrap();
    (pool, store)
}

#[tokio::test(start_paused = true)]
async fn test_failover_within_deadline_without_dropped_reads() {
    let (pool, store) = pool_with(config());
    // replica-2 is the better candidate: less lag
    store.target("replica-1").set_lag(Duration::from_millis(800));
    store.target("replica-2").set_lag(Duration::from_millis(100));

    let mut events = pool.subscribe();
    pool.start().await;

    let readers: Vec<_> = (0..4)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let ctx = RequestContext::new(format!("reader-{}", i));
                let mut served = 0;
                for _ in 0..50 {
                    pool.read(&ctx, &Query::read("SELECT * FROM orders")).await?;
                    served += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok::<_, ResilienceError>(served)
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let lost_at = Instant::now();
    store.target("primary").set_reachable(false);

    let completed = loop {
        match events.recv().await.unwrap() {
            ResilienceEvent::FailoverCompleted {
                old_primary,
                new_primary,
                elapsed,
            } => break (old_primary, new_primary, elapsed),
            ResilienceEvent::FailoverTimeout { .. } => panic!("failover timed out"),
            _ => {}
        }
    };
    assert_eq!(completed.0, "primary");
    assert_eq!(completed.1, "replica-2");
    assert!(completed.2 < Duration::from_secs(30));
    assert!(lost_at.elapsed() < Duration::from_secs(30));

    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), 50);
    }

    // Writes follow the new primary
    let ctx = RequestContext::new("writer");
    pool.write(&ctx, &Query::write("INSERT INTO orders VALUES (1)")).await.unwrap();
    assert_eq!(store.target("replica-2").writes_served(), 1);
    assert_eq!(store.target("replica-2").promotions(), 1);

    let topology = pool.isolator().topology();
    assert_eq!(topology.primary_id(), "replica-2");
    assert_eq!(topology.endpoint("primary").unwrap().role(), Role::Retired);

    let stats = pool.stats();
    assert_eq!(stats.health.failovers, 1);
    assert_eq!(stats.pools.priority.target, "replica-2");

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_timeout_escalates_then_manual_retry() {
    let mut config = config();
    config.health.interval = 5;
    let (pool, store) = pool_with(config);
    store.set_promote_delay(Duration::from_secs(45));

    let mut events = pool.subscribe();
    pool.start().await;
    store.target("primary").set_reachable(false);

    let elapsed = loop {
        match events.recv().await.unwrap() {
            ResilienceEvent::FailoverTimeout { elapsed, .. } => break elapsed,
            ResilienceEvent::FailoverCompleted { .. } => panic!("promotion should not finish"),
            _ => {}
        }
    };
    assert!(elapsed >= Duration::from_secs(30));
    assert_eq!(pool.isolator().topology().primary_id(), "primary");

    // Reads keep flowing to replicas while writes wait for an operator
    let ctx = RequestContext::new("app");
    pool.read(&ctx, &Query::read("SELECT 1")).await.unwrap();

    store.set_promote_delay(Duration::ZERO);
    let promoted = pool.health.trigger_failover().await.unwrap();
    assert_ne!(promoted.id(), "primary");
    assert_eq!(pool.isolator().topology().primary_id(), *promoted.id());

    pool.write(&ctx, &Query::write("INSERT 1")).await.unwrap();
    pool.shutdown().await;
}
