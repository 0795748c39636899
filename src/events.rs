//! Typed resilience events
//!
//! Failure detection (breakers, health probes, failover) and notification
//! delivery are decoupled: components publish [`ResilienceEvent`]s on an
//! [`EventBus`] and an external alerting collaborator subscribes.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::TargetId;

/// Alert severity attached to every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

/// Events published by the resilience layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    PoolExhausted {
        target: TargetId,
        waited: Duration,
    },
    PoolUtilizationHigh {
        target: TargetId,
        utilization: f64,
    },
    CircuitOpened {
        target: TargetId,
        failure_rate: f64,
        samples: usize,
    },
    CircuitHalfOpen {
        target: TargetId,
    },
    CircuitClosed {
        target: TargetId,
    },
    TargetUnhealthy {
        target: TargetId,
        reason: String,
    },
    TargetRecovered {
        target: TargetId,
    },
    ReplicationLagHigh {
        target: TargetId,
        lag: Duration,
    },
    ReplicationLagRecovered {
        target: TargetId,
        lag: Duration,
    },
    FailoverStarted {
        failed_primary: TargetId,
        candidate: TargetId,
    },
    FailoverCompleted {
        old_primary: TargetId,
        new_primary: TargetId,
        elapsed: Duration,
    },
    FailoverTimeout {
        failed_primary: TargetId,
        elapsed: Duration,
    },
    RateLimited {
        identity: String,
        retry_after: Duration,
    },
    CacheUnavailable {
        operation: &'static str,
        error: String,
    },
}

impl ResilienceEvent {
    pub fn severity(&self) -> Severity {
        match self {
            ResilienceEvent::FailoverTimeout { .. } => Severity::Fatal,
            ResilienceEvent::CircuitOpened { .. }
            | ResilienceEvent::TargetUnhealthy { .. }
            | ResilienceEvent::FailoverStarted { .. }
            | ResilienceEvent::PoolExhausted { .. } => Severity::Critical,
            ResilienceEvent::PoolUtilizationHigh { .. }
            | ResilienceEvent::ReplicationLagHigh { .. }
            | ResilienceEvent::CacheUnavailable { .. }
            | ResilienceEvent::RateLimited { .. } => Severity::Warning,
            ResilienceEvent::CircuitHalfOpen { .. }
            | ResilienceEvent::CircuitClosed { .. }
            | ResilienceEvent::TargetRecovered { .. }
            | ResilienceEvent::ReplicationLagRecovered { .. }
            | ResilienceEvent::FailoverCompleted { .. } => Severity::Info,
        }
    }

    /// Short machine-readable name, used as a log field
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::PoolExhausted { .. } => "pool_exhausted",
            ResilienceEvent::PoolUtilizationHigh { .. } => "pool_utilization_high",
            ResilienceEvent::CircuitOpened { .. } => "circuit_opened",
            ResilienceEvent::CircuitHalfOpen { .. } => "circuit_half_open",
            ResilienceEvent::CircuitClosed { .. } => "circuit_closed",
            ResilienceEvent::TargetUnhealthy { .. } => "target_unhealthy",
            ResilienceEvent::TargetRecovered { .. } => "target_recovered",
            ResilienceEvent::ReplicationLagHigh { .. } => "replication_lag_high",
            ResilienceEvent::ReplicationLagRecovered { .. } => "replication_lag_recovered",
            ResilienceEvent::FailoverStarted { .. } => "failover_started",
            ResilienceEvent::FailoverCompleted { .. } => "failover_completed",
            ResilienceEvent::FailoverTimeout { .. } => "failover_timeout",
            ResilienceEvent::RateLimited { .. } => "rate_limited",
            ResilienceEvent::CacheUnavailable { .. } => "cache_unavailable",
        }
    }
}

/// Broadcast channel of resilience events
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ResilienceEvent) {
        trace!(event = event.name(), severity = ?event.severity(), "publishing event");
        // No subscribers is fine: events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(ResilienceEvent::CircuitClosed {
            target: "primary".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "circuit_closed");
        assert_eq!(event.severity(), Severity::Info);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(ResilienceEvent::TargetRecovered {
            target: "r1".to_string(),
        });
    }

    #[test]
    fn test_failover_timeout_is_fatal() {
        let event = ResilienceEvent::FailoverTimeout {
            failed_primary: "primary".to_string(),
            elapsed: Duration::from_secs(31),
        };
        assert_eq!(event.severity(), Severity::Fatal);
        assert!(Severity::Fatal > Severity::Critical);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failover_timeout");
    }
}
