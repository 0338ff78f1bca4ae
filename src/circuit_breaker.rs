//! Process-wide circuit breaker guarding broker operations
//!
//! Failures are counted inside a sliding time window. Reaching the threshold
//! opens the circuit; after the recovery timeout a bounded number of trial
//! operations is admitted (half-open). The first trial success closes the
//! circuit, any trial failure reopens it.
//!
//! All state sits behind one synchronous mutex that is never held across an
//! await, so every read-modify-write is atomic and a trial slot can be given
//! back from `Drop` when a caller abandons an operation.

use crate::error::{BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations flow, failures are counted
    Closed,
    /// Operations are rejected without touching the broker
    Open,
    /// A bounded number of trial operations is admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(30),
            half_open_max_trials: 1,
        }
    }
}

/// Point-in-time view for readiness and metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub recent_failures: usize,
    pub failure_threshold: u32,
    pub half_open_trials_in_flight: u32,
    pub total_trips: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub seconds_in_state: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    state_since: Instant,
    trials_in_flight: u32,
    half_open_epoch: u64,
    total_trips: u64,
    total_successes: u64,
    total_failures: u64,
}

/// How `call` let an operation through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    /// Holds a trial slot of one half-open period
    Trial { epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Says nothing about broker health
    Neutral,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            state_since: now,
            trials_in_flight: 0,
            half_open_epoch: 0,
            total_trips: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.state_since = now;
        self.trials_in_flight = 0;

        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.total_trips += 1;
                metrics().circuit_tripped();
                warn!(
                    from = %from,
                    to = %to,
                    recent_failures = self.failures.len(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                self.half_open_epoch += 1;
                info!(from = %from, to = %to, "Circuit breaker testing recovery");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.failures.clear();
                info!(from = %from, to = %to, "Circuit breaker closed");
            }
        }
    }

    fn count_failure(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        self.failures.push_back(now);
        self.prune(now, config.failure_window);
        if self.failures.len() >= config.failure_threshold as usize {
            self.transition(CircuitState::Open, now);
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Open circuits move to half-open lazily, on the next look
    fn refresh(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.saturating_duration_since(opened_at) >= config.recovery_timeout {
                    self.transition(CircuitState::HalfOpen, now);
                }
            }
        }
    }
}

/// Shared breaker; one instance per process
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::new(Instant::now())),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to run one operation. In half-open this consumes a trial slot that
    /// must be returned through `record_success`, `record_failure` or `release`.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    fn admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh(now, &self.config);

        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.half_open_max_trials {
                    inner.trials_in_flight += 1;
                    Some(Admission::Trial {
                        epoch: inner.half_open_epoch,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Apply the outcome of an operation admitted by `call`.
    ///
    /// Only a trial of the current half-open period moves the breaker out of
    /// half-open or frees a trial slot.
    fn settle(&self, admission: Admission, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match outcome {
            Outcome::Success => inner.total_successes += 1,
            Outcome::Failure => inner.total_failures += 1,
            Outcome::Neutral => {}
        }

        match admission {
            Admission::Normal => {
                if outcome == Outcome::Failure && inner.state == CircuitState::Closed {
                    inner.count_failure(now, &self.config);
                }
            }
            Admission::Trial { epoch } => {
                if inner.state != CircuitState::HalfOpen || inner.half_open_epoch != epoch {
                    return;
                }
                match outcome {
                    Outcome::Success => inner.transition(CircuitState::Closed, now),
                    Outcome::Failure => inner.transition(CircuitState::Open, now),
                    Outcome::Neutral => {
                        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.transition(CircuitState::Closed, now);
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => inner.transition(CircuitState::Open, now),
            CircuitState::Closed => inner.count_failure(now, &self.config),
            // Late result of an operation admitted before the trip
            CircuitState::Open => {}
        }
    }

    /// Return a half-open trial slot for an operation whose outcome says
    /// nothing about broker health
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trials_in_flight > 0 {
            inner.trials_in_flight -= 1;
        }
    }

    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh(now, &self.config);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh(now, &self.config);
        inner.prune(now, self.config.failure_window);

        CircuitBreakerSnapshot {
            state: inner.state,
            recent_failures: inner.failures.len(),
            failure_threshold: self.config.failure_threshold,
            half_open_trials_in_flight: inner.trials_in_flight,
            total_trips: inner.total_trips,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            seconds_in_state: now.saturating_duration_since(inner.state_since).as_secs_f64(),
        }
    }

    /// Force the breaker closed and forget recent failures
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, now);
        inner.failures.clear();
        info!("Circuit breaker manually reset");
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejects with `CircuitOpen` before the future is polled when the
    /// breaker disallows. Dropping the returned future mid-flight gives the
    /// trial slot back.
    pub async fn call<T, F>(&self, operation: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>>,
    {
        let Some(admission) = self.admit() else {
            metrics().circuit_rejected();
            return Err(BridgeError::CircuitOpen {
                state: self.state(),
            });
        };

        let mut permit = TrialPermit {
            breaker: self,
            admission,
            settled: false,
        };
        let result = operation.await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(error) if error.is_broker_failure() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        self.settle(admission, outcome);
        permit.settled = true;

        result
    }
}

struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.admission, Outcome::Neutral);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_within_window() {
        let breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.snapshot().total_trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_bounded_trials() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow(), "only one trial may be in flight");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.allow());
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().recent_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.allow());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().total_trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_trial_slot() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.allow());
        breaker.release();

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_rejects_without_polling_operation() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }

        let mut polled = false;
        let result: BridgeResult<()> = breaker
            .call(async {
                polled = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_ignores_caller_errors() {
        let breaker = breaker();

        for _ in 0..10 {
            let _: BridgeResult<()> = breaker
                .call(async { Err(BridgeError::InvalidDeliveryTag { delivery_tag: 9 }) })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_gives_slot_back() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let pending = breaker.call(std::future::pending::<BridgeResult<()>>());
        let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(outcome.is_err());

        assert!(breaker.allow(), "dropped trial must release its slot");
    }

    /// Operation admitted while closed that finishes during half-open
    fn spawn_gated(
        breaker: &Arc<CircuitBreaker>,
        result: BridgeResult<()>,
    ) -> (oneshot::Sender<()>, JoinHandle<BridgeResult<()>>) {
        let (open_gate, gate) = oneshot::channel::<()>();
        let breaker = Arc::clone(breaker);
        let handle = tokio::spawn(async move {
            breaker
                .call(async move {
                    let _ = gate.await;
                    result
                })
                .await
        });
        (open_gate, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_operation_does_not_free_a_trial_slot() {
        // Arrange
        let breaker = Arc::new(breaker());
        let (finish, late) =
            spawn_gated(&breaker, Err(BridgeError::InvalidDeliveryTag { delivery_tag: 3 }));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow(), "first trial");

        // Act
        finish.send(()).unwrap();
        let late_result = late.await.unwrap();

        // Assert
        assert!(matches!(late_result, Err(BridgeError::InvalidDeliveryTag { .. })));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_trials_in_flight, 1);
        assert!(!breaker.allow(), "second trial admitted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_half_open() {
        let breaker = Arc::new(breaker());
        let (finish, late) = spawn_gated(&breaker, Ok(()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow());

        finish.send(()).unwrap();
        assert!(late.await.unwrap().is_ok());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_late_operation_keeps_trial_limit() {
        let breaker = Arc::new(breaker());
        let (_finish, late) = spawn_gated(&breaker, Ok(()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow());

        late.abort();
        let _ = late.await;

        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_open_breaker() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }
}
