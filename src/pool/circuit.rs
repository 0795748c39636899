//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, connection attempts are allowed
//! - Open: Target has failed, attempts are rejected without touching the network
//! - HalfOpen: Testing recovery, exactly one trial attempt allowed
//!
//! The breaker opens when the failure rate over a rolling window exceeds a
//! threshold, provided enough samples were seen to make the rate meaningful.
//! Every target owns an independent breaker.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventBus, ResilienceEvent};
use crate::store::TargetId;

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open for {target}, retry in {retry_in:?}")]
    CircuitOpen { target: TargetId, retry_in: Duration },
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Target has failed - requests are rejected
    Open {
        /// When the circuit opened; the cooldown counts from here
        opened_at: Instant,
    },

    /// Testing recovery - a single trial is in flight
    HalfOpen {
        /// When the current trial was granted
        trial_started: Instant,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

/// What the breaker granted to a caller
///
/// Handed back with the outcome so that only the current trial can move a
/// half-open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, ordinary attempt
    Normal,
    /// The single half-open trial; its outcome decides the next state
    Trial(u64),
}

impl Admission {
    pub fn is_trial(&self) -> bool {
        matches!(self, Admission::Trial(_))
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0-1.0) that must be exceeded to open the circuit
    pub failure_rate_threshold: f64,

    /// Minimum outcomes in the window before the rate is evaluated
    pub minimum_samples: usize,

    /// Rolling window over which outcomes are counted
    pub window: Duration,

    /// How long the circuit stays open before a trial is allowed
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_samples: 10,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Mutable breaker state, always accessed under the breaker's lock
struct CircuitInner {
    state: CircuitState,

    /// Outcomes inside the rolling window: (when, success)
    outcomes: VecDeque<(Instant, bool)>,

    total_requests: u64,
    total_rejected: u64,
    total_successes: u64,
    total_failures: u64,
    open_count: u64,
    last_transition: Instant,

    /// Sequence number of the most recently granted trial
    trial: u64,
}

impl CircuitInner {
    fn grant_trial(&mut self) -> Admission {
        self.trial += 1;
        Admission::Trial(self.trial)
    }

    fn is_current_trial(&self, admission: Admission) -> bool {
        admission == Admission::Trial(self.trial)
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.outcomes.front() {
            if now.duration_since(at) >= window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn error_rate(&self) -> f64 {
        let outcomes = self.total_successes + self.total_failures;
        if outcomes == 0 {
            return 0.0;
        }
        self.total_failures as f64 / outcomes as f64
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Total admission checks
    pub total_requests: u64,

    /// Checks rejected while open
    pub total_rejected: u64,

    /// Total successes
    pub total_successes: u64,

    /// Total failures
    pub total_failures: u64,

    /// Lifetime error rate
    pub error_rate: f64,

    /// Failure rate inside the rolling window
    pub window_failure_rate: f64,

    /// Outcomes currently inside the rolling window
    pub window_samples: usize,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

/// Failure gate for a single target
pub struct CircuitBreaker {
    target: TargetId,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    /// Create a breaker for one target
    pub fn new(target: impl Into<TargetId>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                total_requests: 0,
                total_rejected: 0,
                total_successes: 0,
                total_failures: 0,
                open_count: 0,
                last_transition: now,
                trial: 0,
            }),
            events: None,
        }
    }

    /// Publish state transitions on the given bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether an attempt may proceed
    pub fn check_request(&self) -> Result<Admission, CircuitError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),

            CircuitState::Open { opened_at } => {
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.open_duration {
                    info!(target_id = %self.target, "Circuit transitioning from Open to HalfOpen");
                    self.transition(&mut inner, CircuitState::HalfOpen { trial_started: now }, now);
                    Ok(inner.grant_trial())
                } else {
                    inner.total_rejected += 1;
                    Err(self.open_error(self.config.open_duration - elapsed))
                }
            }

            CircuitState::HalfOpen { trial_started } => {
                let elapsed = now.duration_since(trial_started);
                if elapsed >= self.config.open_duration {
                    // The previous trial never reported back (cancelled caller).
                    debug!(target_id = %self.target, "Re-granting stale half-open trial");
                    inner.state = CircuitState::HalfOpen { trial_started: now };
                    Ok(inner.grant_trial())
                } else {
                    inner.total_rejected += 1;
                    Err(self.open_error(self.config.open_duration - elapsed))
                }
            }
        }
    }

    /// Record a successful attempt made under `admission`
    pub fn record_success(&self, admission: Admission) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.outcomes.push_back((now, true));
                self.evaluate(&mut inner, now);
            }

            CircuitState::HalfOpen { .. } if !inner.is_current_trial(admission) => {
                debug!(target_id = %self.target, "Ignoring non-trial success while HalfOpen");
            }

            CircuitState::HalfOpen { .. } => {
                info!(target_id = %self.target, "Trial succeeded, circuit transitioning from HalfOpen to Closed");
                self.transition(&mut inner, CircuitState::Closed, now);
            }

            CircuitState::Open { .. } => {
                // A call admitted before the circuit opened finished late.
                debug!(target_id = %self.target, "Ignoring success reported while Open");
            }
        }
    }

    /// Record a failed attempt made under `admission`
    pub fn record_failure(&self, admission: Admission) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.outcomes.push_back((now, false));
                self.evaluate(&mut inner, now);
            }

            CircuitState::HalfOpen { .. } if !inner.is_current_trial(admission) => {
                debug!(target_id = %self.target, "Ignoring non-trial failure while HalfOpen");
            }

            CircuitState::HalfOpen { .. } => {
                warn!(target_id = %self.target, "Trial failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open { opened_at: now }, now);
            }

            CircuitState::Open { .. } => {
                debug!(target_id = %self.target, "Ignoring failure reported while Open");
            }
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    /// Check if the circuit is closed
    pub fn is_healthy(&self) -> bool {
        matches!(self.inner.lock().state, CircuitState::Closed)
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.config.window);
        CircuitStats {
            state: inner.state.clone(),
            total_requests: inner.total_requests,
            total_rejected: inner.total_rejected,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            error_rate: inner.error_rate(),
            window_failure_rate: inner.window_failure_rate(),
            window_samples: inner.outcomes.len(),
            open_count: inner.open_count,
            time_in_state: now.duration_since(inner.last_transition),
        }
    }

    /// Manually reset the circuit to closed state
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        info!(target_id = %self.target, "Manually resetting circuit to Closed");
        self.transition(&mut inner, CircuitState::Closed, now);
    }

    fn open_error(&self, retry_in: Duration) -> CircuitError {
        CircuitError::CircuitOpen {
            target: self.target.clone(),
            retry_in,
        }
    }

    /// Open the circuit if the windowed failure rate crosses the threshold
    fn evaluate(&self, inner: &mut CircuitInner, now: Instant) {
        inner.prune(now, self.config.window);

        let samples = inner.outcomes.len();
        if samples < self.config.minimum_samples {
            return;
        }

        let failure_rate = inner.window_failure_rate();
        if failure_rate > self.config.failure_rate_threshold {
            warn!(
                target_id = %self.target,
                failure_rate = failure_rate,
                samples = samples,
                "Circuit transitioning from Closed to Open"
            );
            self.transition(inner, CircuitState::Open { opened_at: now }, now);
        }
    }

    fn transition(&self, inner: &mut CircuitInner, next: CircuitState, now: Instant) {
        let event = match &next {
            CircuitState::Open { .. } => {
                inner.open_count += 1;
                ResilienceEvent::CircuitOpened {
                    target: self.target.clone(),
                    failure_rate: inner.window_failure_rate(),
                    samples: inner.outcomes.len(),
                }
            }
            CircuitState::HalfOpen { .. } => ResilienceEvent::CircuitHalfOpen {
                target: self.target.clone(),
            },
            CircuitState::Closed => {
                inner.outcomes.clear();
                ResilienceEvent::CircuitClosed {
                    target: self.target.clone(),
                }
            }
        };

        inner.state = next;
        inner.last_transition = now;

        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixty_percent_failures_open_circuit() {
        let breaker = breaker();

        for _ in 0..6 {
            breaker.record_failure(Admission::Normal);
        }
        // Below the minimum sample size the circuit stays closed
        assert!(breaker.is_healthy());

        for _ in 0..4 {
            breaker.record_success(Admission::Normal);
        }
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
        assert!(breaker.check_request().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker();
        for _ in 0..6 {
            breaker.record_failure(Admission::Normal);
        }
        for _ in 0..4 {
            breaker.record_success(Admission::Normal);
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.check_request().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.check_request().unwrap();
        assert!(trial.is_trial());
        // Only one trial at a time
        assert!(breaker.check_request().is_err());

        breaker.record_failure(trial);
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));

        // Timer restarted at the failed trial
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.check_request().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.check_request().unwrap();
        assert!(trial.is_trial());

        breaker.record_success(trial);
        assert!(breaker.is_healthy());
        assert_eq!(breaker.stats().window_samples, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_half_does_not_open() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(Admission::Normal);
            breaker.record_success(Admission::Normal);
        }
        assert!(breaker.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_outcomes_leave_window() {
        let breaker = breaker();
        for _ in 0..9 {
            breaker.record_failure(Admission::Normal);
        }

        tokio::time::advance(Duration::from_secs(61)).await;

        // The nine failures expired; this lone failure is below the sample minimum
        breaker.record_failure(Admission::Normal);
        assert!(breaker.is_healthy());
        assert_eq!(breaker.stats().window_samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_is_regranted() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.record_failure(Admission::Normal);
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        let first = breaker.check_request().unwrap();
        assert!(first.is_trial());

        // The trial caller went away without reporting
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = breaker.check_request().unwrap();
        assert!(second.is_trial());
        assert_ne!(first, second);

        // A late report from the abandoned trial does not decide anything
        breaker.record_success(first);
        assert_eq!(breaker.state().name(), "HalfOpen");
        breaker.record_success(second);
        assert!(breaker.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_trial_moves_half_open() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.record_failure(Admission::Normal);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breaker.check_request().unwrap();
        assert!(trial.is_trial());

        // Calls admitted before the circuit opened finish while HalfOpen
        breaker.record_success(Admission::Normal);
        assert_eq!(breaker.state().name(), "HalfOpen");
        breaker.record_failure(Admission::Normal);
        assert_eq!(breaker.state().name(), "HalfOpen");

        breaker.record_failure(trial);
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
        assert_eq!(breaker.stats().open_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let bus = EventBus::new(256);
        let mut rx = bus.subscribe();
        let breaker = Arc::new(breaker().with_events(bus));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&breaker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    b.record_failure(Admission::Normal);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut opened = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ResilienceEvent::CircuitOpened { .. }) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(breaker.stats().open_count, 1);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.record_failure(Admission::Normal);
        }
        assert!(!breaker.is_healthy());

        breaker.reset();
        assert!(breaker.is_healthy());
        assert!(breaker.check_request().is_ok());
    }

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::Closed.name(), "Closed");
        assert_eq!(
            CircuitState::Open {
                opened_at: Instant::now()
            }
            .name(),
            "Open"
        );
        assert_eq!(
            CircuitState::HalfOpen {
                trial_started: Instant::now()
            }
            .name(),
            "HalfOpen"
        );
    }
}
