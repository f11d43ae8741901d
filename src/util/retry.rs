//! Retry with exponential backoff, and a three-state circuit breaker.
//!
//! Breakers are per failure domain: one per bus stream in the producer,
//! one per endpoint in the streaming client. A tripped breaker fails fast
//! without touching the underlying transport until `recovery_timeout` has
//! elapsed, then lets exactly one probe through.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RetryConfig;

// =============================================================================
// RETRY POLICY
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `attempt` (0-based), jittered by
    /// uniform ±25% when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let jitter_range = capped * 0.25;
            let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Run `op` with up to `policy.max_attempts` attempts, re-raising the last
/// failure after exhaustion.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 == policy.max_attempts {
                    warn!(attempts = policy.max_attempts, error = %err, "retries_exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }

    // Unreachable for max_attempts >= 1, kept for completeness.
    Err(last_err.expect("retry_async requires max_attempts >= 1"))
}

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E: Display> {
    #[error("circuit breaker is open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Gate a call. `Err(())` means fail fast; the underlying operation must
    /// not run. An `Ok(())` from the Open state means the breaker moved to
    /// HalfOpen and this call is the probe.
    pub fn try_acquire(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "breaker_half_open");
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "breaker_closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "breaker_reopened");
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "breaker_opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.try_acquire().is_err() {
            return Err(BreakerError::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_delays_are_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        };

        for attempt in 0..10 {
            let expected = (0.1 * 2f64.powi(attempt)).min(5.0);
            let delay = policy.delay_for_attempt(attempt as u32).as_secs_f64();
            assert!(delay >= expected * 0.75 - 1e-9, "attempt {attempt}: {delay}");
            assert!(delay <= expected * 1.25 + 1e-9, "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };

        let result: Result<u32, String> = retry_async(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reraises_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            jitter: false,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_async(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_at_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));

        for _ in 0..3 {
            let _: Result<(), _> = breaker
                .call(|| async { Err::<(), _>("fail".to_string()) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Within the recovery timeout the underlying call must not run.
        let ran = AtomicU32::new(0);
        let result = breaker
            .call(|| {
                ran.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_recovers_through_half_open() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_secs(10));

        for _ in 0..2 {
            let _: Result<(), _> = breaker
                .call(|| async { Err::<(), _>("fail".to_string()) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(11)).await;

        // Probe succeeds, breaker closes.
        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(5));

        let _: Result<(), _> = breaker
            .call(|| async { Err::<(), _>("fail".to_string()) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(6)).await;

        let _: Result<(), _> = breaker
            .call(|| async { Err::<(), _>("still failing".to_string()) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
