//! Circuit breaker implementation.

mod registry;

pub use registry::CircuitBreakerRegistry;

use ferry_core::FerryError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed.
    Closed,
    /// Circuit is open - requests are rejected.
    Open,
    /// Circuit is half-open - limited trial requests are allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures inside the monitoring window before opening the circuit.
    pub failure_threshold: u64,
    /// Number of successes needed to close the circuit from half-open.
    pub success_threshold: u64,
    /// Duration to wait before transitioning from open to half-open.
    pub recovery_timeout: Duration,
    /// Sliding window in which failures are counted.
    pub monitoring_window: Duration,
    /// Number of trial requests allowed in flight while half-open.
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(120),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u64,
    half_open_in_flight: u64,
    last_failure_at: Option<Instant>,
    /// Bumped on every entry into half-open; trial permits carry the value
    /// they were issued under.
    half_open_epoch: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            half_open_in_flight: 0,
            last_failure_at: None,
            half_open_epoch: 0,
        }
    }

    /// Resets to closed, keeping the epoch so older trial permits stay stale.
    fn close(&mut self) {
        let epoch = self.half_open_epoch;
        *self = Self::closed();
        self.half_open_epoch = epoch;
    }

    /// Frees the slot of a trial issued in the current half-open period.
    ///
    /// Returns false for stale or non-trial outcomes, which must not move the state.
    fn release_trial(&mut self, trial: Option<u64>) -> bool {
        match trial {
            Some(epoch) if self.state == CircuitState::HalfOpen && epoch == self.half_open_epoch => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of a breaker, for logging and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name (usually the job kind).
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted in the current monitoring window.
    pub failure_count: u64,
    /// Successful trial calls while half-open.
    pub success_count: u64,
    /// Time elapsed since the last recorded failure.
    pub since_last_failure: Option<Duration>,
}

/// Circuit breaker for protecting against cascading failures.
///
/// State lives behind a single mutex so concurrent callers of the same
/// breaker always observe a consistent transition.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner::closed()),
            config,
        }
    }

    /// Creates a new circuit breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Returns the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the name of the circuit breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Executes a function with circuit breaker protection.
    ///
    /// When the circuit is open the function is never invoked. A half-open
    /// trial that panics or is dropped before finishing counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `counts` returns
    /// true are recorded as failures.
    ///
    /// Other errors leave the failure window untouched; a half-open trial
    /// ending that way just frees its slot.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        counts: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let permit = match self.try_acquire() {
            Some(trial) => CallPermit::new(self, trial),
            None => return Err(CircuitBreakerError::Open(self.name.clone())),
        };

        match f().await {
            Ok(result) => {
                permit.settle(Outcome::Success);
                Ok(result)
            }
            Err(e) => {
                let outcome = if counts(&e) {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                permit.settle(outcome);
                Err(CircuitBreakerError::Failure(e))
            }
        }
    }

    /// Decides whether a request may proceed.
    ///
    /// Returns `None` when rejected, otherwise the half-open epoch for trial
    /// requests and `Some(None)` for ordinary ones.
    fn try_acquire(&self) -> Option<Option<u64>> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_in_flight = 1;
                inner.half_open_epoch += 1;
                debug!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                Some(Some(inner.half_open_epoch))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return None;
                }
                inner.half_open_in_flight += 1;
                Some(Some(inner.half_open_epoch))
            }
        }
    }

    fn record_success(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::HalfOpen => {
                if !inner.release_trial(trial) {
                    return;
                }
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.close();
                    info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            // A call admitted before the circuit opened; its outcome is stale.
            CircuitState::Open => {}
        }
    }

    fn record_ignored(&self, trial: Option<u64>) {
        self.inner.lock().release_trial(trial);
    }

    fn record_failure(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.prune(self.config.monitoring_window, now);
                inner.failures.push_back(now);
                inner.last_failure_at = Some(now);

                let failures = inner.failures.len() as u64;
                if failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if !inner.release_trial(trial) {
                    return;
                }
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_failure_at = Some(now);
                warn!(
                    breaker = %self.name,
                    "Circuit breaker reopened after failure in half-open state"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Returns a snapshot of the breaker's counters.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            inner.prune(self.config.monitoring_window, Instant::now());
        }

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u64,
            success_count: inner.success_count,
            since_last_failure: inner.last_failure_at.map(|at| at.elapsed()),
        }
    }

    /// Manually resets the circuit breaker to closed state.
    pub fn reset(&self) {
        self.inner.lock().close();
        debug!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Admission for one protected call.
///
/// Dropping an unsettled trial permit reopens the circuit, so a panicking
/// or cancelled trial cannot hold its half-open slot forever.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: Option<u64>) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        match outcome {
            Outcome::Success => self.breaker.record_success(self.trial),
            Outcome::Failure => self.breaker.record_failure(self.trial),
            Outcome::Ignored => self.breaker.record_ignored(self.trial),
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled || self.trial.is_none() {
            return;
        }
        warn!(breaker = %self.breaker.name, "Half-open trial abandoned before completing");
        self.breaker.record_failure(self.trial);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request was rejected.
    Open(String),
    /// The underlying operation failed.
    Failure(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns true if the request was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(name) => write!(f, "Circuit breaker '{}' is open", name),
            Self::Failure(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(_) => None,
            Self::Failure(e) => Some(e),
        }
    }
}

impl<E> From<CircuitBreakerError<E>> for FerryError
where
    E: fmt::Display,
{
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open(name) => FerryError::CircuitBreakerOpen(name),
            CircuitBreakerError::Failure(e) => FerryError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(failure_threshold: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(40),
            monitoring_window: Duration::from_secs(10),
            half_open_max_calls: 1,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Err::<(), &str>("error") }).await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed() {
        let cb = CircuitBreaker::with_defaults("test");

        let result = cb.call(|| async { Ok::<i32, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let cb = CircuitBreaker::new("test", fast_config(2));

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok::<i32, &str>(42) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_handler() {
        let cb = CircuitBreaker::new("guarded", fast_config(1));
        fail(&cb).await;

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("reset", fast_config(2));

        fail(&cb).await;
        let _ = cb.call(|| async { Ok::<(), &str>(()) }).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let config = CircuitBreakerConfig {
            monitoring_window: Duration::from_millis(20),
            ..fast_config(2)
        };
        let cb = CircuitBreaker::new("window", config);

        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_to_half_open_to_closed() {
        let cb = CircuitBreaker::new("recover", fast_config(1));
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let observed = cb
            .call(|| async { Ok::<CircuitState, &str>(CircuitState::HalfOpen) })
            .await;
        assert!(observed.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_state_observed_during_trial() {
        let cb = Arc::new(CircuitBreaker::new("trial", fast_config(1)));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let inner = cb.clone();
        let seen = cb
            .call(|| async move { Ok::<CircuitState, &str>(inner.state()) })
            .await
            .unwrap();
        assert_eq!(seen, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("reopen", fast_config(1));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // The recovery timer restarted with the half-open failure.
        let result = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(result.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn test_half_open_limits_trial_calls() {
        let cb = Arc::new(CircuitBreaker::new("limited", fast_config(1)));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = rx.await;
                    Ok::<(), &str>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let rejected = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(rejected.unwrap_err().is_open());

        tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_panicking_trial_reopens_circuit() {
        let cb = Arc::new(CircuitBreaker::new("panics", fast_config(1)));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok::<(), &str>(())
                })
                .await
        });
        assert!(trial.await.unwrap_err().is_panic());

        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.call(|| async { Ok::<(), &str>(()) }).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let cb = CircuitBreaker::new("cancelled", fast_config(1));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<Result<(), &str>>()),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.call(|| async { Ok::<(), &str>(()) }).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_trial_does_not_touch_new_half_open_period() {
        let config = CircuitBreakerConfig {
            half_open_max_calls: 2,
            ..fast_config(1)
        };
        let cb = Arc::new(CircuitBreaker::new("stale", config));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow_cb = cb.clone();
        let slow = tokio::spawn(async move {
            slow_cb
                .call(|| async move {
                    let _ = rx.await;
                    Err::<(), &str>("late")
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second trial fails and reopens; the next period starts after the timeout.
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();
        let held_cb = cb.clone();
        let held = tokio::spawn(async move {
            held_cb
                .call(|| async move {
                    let _ = held_rx.await;
                    Ok::<(), &str>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tx.send(()).unwrap();
        assert!(slow.await.unwrap().is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        held_tx.send(()).unwrap();
        assert!(held.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_open_circuit() {
        let cb = CircuitBreaker::new("classified", fast_config(2));

        for _ in 0..5 {
            let result = cb
                .call_classified(|| async { Err::<(), &str>("bad input") }, |e| *e != "bad input")
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Failure("bad input"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);

        for _ in 0..2 {
            let _ = cb
                .call_classified(|| async { Err::<(), &str>("down") }, |e| *e != "bad input")
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_ignored_error_frees_half_open_slot() {
        let cb = CircuitBreaker::new("ignored-trial", fast_config(1));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = cb
            .call_classified(|| async { Err::<(), &str>("bad input") }, |_| false)
            .await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.call(|| async { Ok::<(), &str>(()) }).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_threshold_above_one() {
        let config = CircuitBreakerConfig {
            success_threshold: 2,
            ..fast_config(1)
        };
        let cb = CircuitBreaker::new("two-successes", config);
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let cb = CircuitBreaker::new("manual", fast_config(1));
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.snapshot().since_last_failure.is_none());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_open_error_converts_to_ferry_error() {
        let err: FerryError = CircuitBreakerError::<&str>::Open("reminder-processing".into()).into();
        assert!(matches!(err, FerryError::CircuitBreakerOpen(name) if name == "reminder-processing"));
    }
}
