//! Error taxonomy surfaced by the request-scoped API

use std::time::Duration;

use crate::pool::{CircuitError, PoolError};
use crate::ratelimit::LimitScope;
use crate::store::{QueryKind, StoreError, TargetId};

/// Errors returned by [`crate::ResiliencePool`]
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("Pool exhausted for {target} after waiting {waited:?}")]
    PoolExhausted { target: TargetId, waited: Duration },

    #[error("Failed to connect to {target} after {attempts} attempts: {source}")]
    ConnectionFailed {
        target: TargetId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Circuit breaker is open for {target}, retry in {retry_in:?}")]
    CircuitOpen { target: TargetId, retry_in: Duration },

    #[error("Rate limited ({scope:?}) for {identity}, retry after {retry_after:?}")]
    RateLimited {
        identity: String,
        scope: LimitScope,
        retry_after: Duration,
    },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Replica {target} lag {lag:?} exceeds threshold")]
    ReplicaLagExceeded { target: TargetId, lag: Duration },

    #[error("Failover from {failed_primary} did not complete within {elapsed:?}")]
    FailoverTimeout {
        failed_primary: TargetId,
        elapsed: Duration,
    },

    #[error("No healthy replica available to replace {0}")]
    NoFailoverCandidate(TargetId),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("Pool for {0} is shut down")]
    PoolClosed(TargetId),

    #[error("{actual:?} query submitted where a {expected:?} query is required")]
    QueryKindMismatch { expected: QueryKind, actual: QueryKind },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResilienceError {
    /// Whether the caller may retry the same operation after backing off
    pub fn is_retriable(&self) -> bool {
        match self {
            ResilienceError::PoolExhausted { .. }
            | ResilienceError::ConnectionFailed { .. }
            | ResilienceError::DeadlineExceeded => true,
            ResilienceError::Store(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Hint for how long to wait before retrying, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::RateLimited { retry_after, .. } => Some(*retry_after),
            ResilienceError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

impl From<PoolError> for ResilienceError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolExhausted { target, waited } => {
                ResilienceError::PoolExhausted { target, waited }
            }
            PoolError::ConnectionFailed {
                target,
                attempts,
                source,
            } => ResilienceError::ConnectionFailed {
                target,
                attempts,
                source,
            },
            PoolError::Circuit(CircuitError::CircuitOpen { target, retry_in }) => {
                ResilienceError::CircuitOpen { target, retry_in }
            }
            PoolError::UnknownTarget(target) => ResilienceError::UnknownTarget(target),
            PoolError::Closed(target) => ResilienceError::PoolClosed(target),
            PoolError::Cancelled => ResilienceError::Cancelled,
            PoolError::DeadlineExceeded => ResilienceError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let exhausted = ResilienceError::PoolExhausted {
            target: "primary".into(),
            waited: Duration::from_secs(5),
        };
        assert!(exhausted.is_retriable());

        let open = ResilienceError::CircuitOpen {
            target: "primary".into(),
            retry_in: Duration::from_secs(12),
        };
        assert!(!open.is_retriable());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(12)));

        let limited = ResilienceError::RateLimited {
            identity: "u1".into(),
            scope: LimitScope::Identity,
            retry_after: Duration::from_millis(250),
        };
        assert!(!limited.is_retriable());
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(250)));

        assert!(ResilienceError::Store(StoreError::ConnectionLost("x".into())).is_retriable());
        assert!(!ResilienceError::Store(StoreError::Query("x".into())).is_retriable());
    }

    #[test]
    fn test_pool_error_conversion() {
        let err: ResilienceError = PoolError::Circuit(CircuitError::CircuitOpen {
            target: "r1".into(),
            retry_in: Duration::from_secs(3),
        })
        .into();
        assert!(matches!(err, ResilienceError::CircuitOpen { ref target, .. } if target == "r1"));

        let err: ResilienceError = PoolError::Cancelled.into();
        assert!(matches!(err, ResilienceError::Cancelled));
    }
}
