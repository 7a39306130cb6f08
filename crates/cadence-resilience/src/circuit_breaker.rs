//! Circuit breaker for calls to a named external dependency

use cadence_core::{Classify, ErrorClass, SharedClock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit tripped - requests fail immediately
    Open,
    /// Testing recovery - one trial request at a time
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to wait in open state before a trial call
    pub cooldown_ms: u64,
    /// Consecutive trial successes needed to close again
    pub half_open_success_threshold: u32,
    /// Cooldown growth factor for every re-open without an intervening close
    pub cooldown_multiplier: f64,
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_success_threshold: 1,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 300_000,
        }
    }
}

impl BreakerConfig {
    /// Conservative settings for critical dependencies
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            half_open_success_threshold: 3,
            ..Default::default()
        }
    }

    /// Cooldown after `reopen_count` consecutive re-opens
    pub fn cooldown_for(&self, reopen_count: u32) -> Duration {
        let factor = self.cooldown_multiplier.max(1.0).powi(reopen_count.min(32) as i32);
        let ms = (self.cooldown_ms as f64 * factor).min(self.max_cooldown_ms.max(self.cooldown_ms) as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Persistable breaker state for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Re-opens since the circuit was last closed; drives cooldown growth
    pub reopen_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_trial_in_flight: bool,
}

impl CircuitBreakerState {
    pub fn closed(dependency: &str) -> Self {
        Self {
            dependency: dependency.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            reopen_count: 0,
            last_failure_at: None,
            opened_at: None,
            half_open_trial_in_flight: false,
        }
    }
}

/// Circuit breaker error
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit '{dependency}' is open - retry after {retry_after_ms}ms")]
    Open {
        dependency: String,
        retry_after_ms: u64,
    },
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: Classify> Classify for BreakerError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Open { .. } => ErrorClass::DependencyDown,
            Self::Inner(e) => e.class(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub total_opens: u64,
    pub consecutive_failures: u32,
}

/// Thread-safe circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<CircuitBreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    total_opens: AtomicU64,
}

/// Admission ticket returned by [`CircuitBreaker::acquire`].
///
/// A half-open trial permit that is dropped without an outcome (the call was
/// cancelled) releases the trial slot so the breaker cannot wedge.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut state = self.breaker.inner.lock();
            state.half_open_trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig, clock: SharedClock) -> Self {
        Self::from_state(CircuitBreakerState::closed(name), config, clock)
    }

    /// Rebuild a breaker from a persisted snapshot
    pub fn from_state(mut state: CircuitBreakerState, config: BreakerConfig, clock: SharedClock) -> Self {
        // A trial that was in flight when the snapshot was taken never finished.
        state.half_open_trial_in_flight = false;
        Self {
            name: state.dependency.clone(),
            config,
            clock,
            inner: Mutex::new(state),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_opens: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.inner.lock().clone()
    }

    /// Ask for permission to call the dependency
    pub fn acquire(&self) -> Result<Permit<'_>, BreakerError<std::convert::Infallible>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.inner.lock();

        match state.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => {
                let cooldown = self.config.cooldown_for(state.reopen_count);
                let opened_at = state.opened_at.unwrap_or(now);
                let reopen_at = opened_at
                    .checked_add_signed(to_chrono(cooldown))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if now >= reopen_at {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    state.half_open_trial_in_flight = true;
                    tracing::info!(circuit = %self.name, "Circuit transitioned to HalfOpen");
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(BreakerError::Open {
                        dependency: self.name.clone(),
                        retry_after_ms: (reopen_at - now).num_milliseconds().max(0) as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_trial_in_flight {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(BreakerError::Open {
                        dependency: self.name.clone(),
                        retry_after_ms: 0,
                    })
                } else {
                    state.half_open_trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.inner.lock();
        match state.state {
            CircuitState::HalfOpen if trial => {
                state.half_open_trial_in_flight = false;
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_success_threshold.max(1) {
                    let dependency = std::mem::take(&mut state.dependency);
                    *state = CircuitBreakerState::closed(&dependency);
                    tracing::info!(circuit = %self.name, "Circuit recovered - now Closed");
                }
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.inner.lock();
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold.max(1) {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    self.total_opens.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = state.consecutive_failures,
                        cooldown_ms = self.config.cooldown_for(state.reopen_count).as_millis() as u64,
                        "Circuit tripped - now Open"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                state.consecutive_failures += 1;
                state.reopen_count += 1;
                state.half_open_successes = 0;
                state.half_open_trial_in_flight = false;
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                self.total_opens.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    circuit = %self.name,
                    reopen_count = state.reopen_count,
                    cooldown_ms = self.config.cooldown_for(state.reopen_count).as_millis() as u64,
                    "Trial call failed - circuit back to Open"
                );
            }
            _ => {
                state.consecutive_failures += 1;
            }
        }
    }

    /// Execute `fut` under breaker protection.
    ///
    /// Only errors whose class counts against the dependency (transient,
    /// dependency-down) are recorded as failures; a fatal error still means the
    /// dependency answered.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(BreakerError::Open {
                dependency,
                retry_after_ms,
            }) => {
                tracing::debug!(circuit = %dependency, retry_after_ms, "Call rejected, circuit open");
                return Err(BreakerError::Open {
                    dependency,
                    retry_after_ms,
                });
            }
            Err(BreakerError::Inner(never)) => match never {},
        };

        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if e.class().counts_against_dependency() {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.inner.lock();
        CircuitStats {
            name: self.name.clone(),
            state: state.state,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_opens: self.total_opens.load(Ordering::Relaxed),
            consecutive_failures: state.consecutive_failures,
        }
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ManualClock;
    use std::sync::Arc;

    #[derive(Debug)]
    struct DepError(ErrorClass);

    impl Classify for DepError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    fn breaker(threshold: u32, clock: Arc<ManualClock>) -> CircuitBreaker {
        let config = BreakerConfig {
            failure_threshold: threshold,
            cooldown_ms: 1_000,
            half_open_success_threshold: 1,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 10_000,
        };
        CircuitBreaker::new("test", config, clock)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<DepError>> {
        cb.call(async { Err::<(), _>(DepError(ErrorClass::Transient)) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_and_recovers() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(2, clock.clone());

        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected while cooling down
        assert!(fail(&cb).await.unwrap_err().is_open());

        clock.advance(ChronoDuration::milliseconds(1_000));
        let ok: Result<u8, BreakerError<DepError>> = cb.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_fatal_errors_do_not_trip() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(1, clock);

        let err = cb
            .call(async { Err::<(), _>(DepError(ErrorClass::Fatal)) })
            .await
            .unwrap_err();
        assert!(!err.is_open());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_trial_grows_cooldown() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(1, clock.clone());

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(ChronoDuration::milliseconds(1_000));
        let _ = fail(&cb).await; // trial fails
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().reopen_count, 1);

        // Original cooldown no longer enough
        clock.advance(ChronoDuration::milliseconds(1_000));
        assert!(fail(&cb).await.unwrap_err().is_open());

        clock.advance(ChronoDuration::milliseconds(1_000));
        let ok: Result<(), BreakerError<DepError>> = cb.call(async { Ok(()) }).await;
        assert!(ok.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().reopen_count, 0);
    }

    #[test]
    fn test_dropped_trial_permit_releases_slot() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(1, clock.clone());
        cb.acquire().unwrap().failure();
        clock.advance(ChronoDuration::milliseconds(1_000));

        let permit = cb.acquire().unwrap();
        assert!(permit.is_trial());
        assert!(cb.acquire().is_err());
        drop(permit);

        assert!(cb.acquire().unwrap().is_trial());
    }

    #[test]
    fn test_cooldown_is_capped() {
        let config = BreakerConfig::default();
        assert_eq!(config.cooldown_for(0), Duration::from_secs(30));
        assert_eq!(config.cooldown_for(1), Duration::from_secs(60));
        assert_eq!(config.cooldown_for(20), Duration::from_secs(300));
    }
}
