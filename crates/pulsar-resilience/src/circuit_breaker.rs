//! Circuit breaker with exponential-backoff retry.
//!
//! One breaker guards one peer. It has three states:
//! - Closed: calls pass through
//! - Open: the peer failed repeatedly, calls fail fast until the cooldown ends
//! - HalfOpen: the cooldown ended, the next calls try the peer again

use crate::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Calls fail fast until `retry_at`
    Open { retry_at: Instant },
    HalfOpen,
}

/// Retry schedule for a single guarded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 disables retrying)
    pub max_retries: usize,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor applied after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: usize) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: usize,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: usize,
    /// Time spent open before probing again
    pub cooldown: Duration,
    pub retry: RetryPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
}

/// Circuit breaker protecting calls to one peer.
///
/// Cloning is cheap and clones share state.
///
/// ```no_run
/// use pulsar_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let breaker = CircuitBreaker::new("10.0.0.2:1234", CircuitBreakerConfig::default());
/// let ack = breaker
///     .execute(|| async { Ok::<_, ResilienceError>("ok") })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn get_failure_count(&self) -> usize {
        self.state.lock().await.consecutive_failures
    }

    /// Runs `op`, retrying transient failures according to the retry policy.
    ///
    /// Permanent failures are returned immediately. When the retries run out
    /// the result is [`ResilienceError::RetriesExhausted`].
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let policy = &self.config.retry;
        let mut retry = 0;

        loop {
            self.check_and_update_state().await?;

            match op().await {
                Ok(value) => {
                    self.on_success().await;
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retry < policy.max_retries => {
                    self.on_failure().await;
                    retry += 1;
                    let delay = policy.backoff(retry);
                    warn!(
                        peer = %self.name,
                        retry,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ResilienceError::Transient(last)) => {
                    self.on_failure().await;
                    return Err(ResilienceError::RetriesExhausted {
                        attempts: retry + 1,
                        last,
                    });
                }
                Err(e) => {
                    if e.should_trip_breaker() {
                        self.on_failure().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn check_and_update_state(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { retry_at } => {
                if Instant::now() >= retry_at {
                    debug!(peer = %self.name, "Cooldown elapsed, probing peer");
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen)
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    debug!(peer = %self.name, "Peer recovered, closing circuit");
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                }
            }
            _ => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        peer = %self.name,
                        failures = state.consecutive_failures,
                        "Opening circuit"
                    );
                    state.state = CircuitState::Open {
                        retry_at: Instant::now() + self.config.cooldown,
                    };
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open {
                    retry_at: Instant::now() + self.config.cooldown,
                };
                state.consecutive_successes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(max_retries: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            retry: RetryPolicy {
                max_retries,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(8), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_policy_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_retries = 7").unwrap();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_backoff_ms, 100);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let breaker = CircuitBreaker::new("peer-a", fast_config(3));
        let calls = AtomicUsize::new(0);

        let result = breaker
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ResilienceError::Transient("connection reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.get_failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let breaker = CircuitBreaker::new("peer-a", fast_config(2));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Transient("refused".into()))
            })
            .await;

        assert_eq!(
            result,
            Err(ResilienceError::RetriesExhausted {
                attempts: 3,
                last: "refused".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let breaker = CircuitBreaker::new("peer-a", fast_config(5));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Permanent("bad request".into()))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_fails_fast() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            ..fast_config(0)
        };
        let breaker = CircuitBreaker::new("peer-b", config);

        for _ in 0..2 {
            let _: Result<(), _> = breaker
                .execute(|| async { Err(ResilienceError::Transient("down".into())) })
                .await;
        }
        assert!(matches!(
            breaker.get_state().await,
            CircuitState::Open { .. }
        ));

        let result = breaker.execute(|| async { Ok::<_, ResilienceError>(()) }).await;
        assert_eq!(result, Err(ResilienceError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_half_open_recovers() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            cooldown: Duration::from_millis(20),
            ..fast_config(0)
        };
        let breaker = CircuitBreaker::new("peer-c", config);

        let _: Result<(), _> = breaker
            .execute(|| async { Err(ResilienceError::Transient("down".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = breaker.execute(|| async { Ok::<_, ResilienceError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
    }
}
