//! Circuit breaker for the automated responder
//!
//! Opens after a run of consecutive failures and rejects calls until an
//! exponentially growing backoff has elapsed, then lets one test request
//! through (half-open). Any success closes it again.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Minimum backoff duration when circuit opens
    pub min_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    current_backoff: Duration,
}

impl BreakerState {
    fn closed(min_backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
            current_backoff: min_backoff,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    state: RwLock<BreakerState>,
    config: CircuitBreakerConfig,
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit breaker is open - call rejected
    Rejected,
    /// Inner error from the operation
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: RwLock::new(BreakerState::closed(config.min_backoff)),
            config,
        }
    }

    pub async fn is_call_permitted(&self) -> bool {
        let state = self.state.read().await;

        if state.consecutive_failures < self.config.failure_threshold {
            return true;
        }
        match state.last_failure_time {
            Some(last_failure) if last_failure.elapsed() < state.current_backoff => {
                tracing::debug!(
                    breaker = self.name,
                    failures = state.consecutive_failures,
                    backoff_remaining = ?state.current_backoff.saturating_sub(last_failure.elapsed()),
                    "Circuit breaker OPEN - rejecting call"
                );
                false
            }
            _ => {
                tracing::debug!(breaker = self.name, "Circuit breaker HALF-OPEN - allowing test request");
                true
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if state.consecutive_failures > 0 {
            tracing::info!(
                breaker = self.name,
                previous_failures = state.consecutive_failures,
                "Circuit breaker reset - request succeeded"
            );
            *state = BreakerState::closed(self.config.min_backoff);
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());

        if state.consecutive_failures >= self.config.failure_threshold {
            let exponent = state
                .consecutive_failures
                .saturating_sub(self.config.failure_threshold)
                .min(16);
            state.current_backoff = self
                .config
                .min_backoff
                .saturating_mul(2u32.pow(exponent))
                .min(self.config.max_backoff);

            tracing::warn!(
                breaker = self.name,
                consecutive_failures = state.consecutive_failures,
                backoff = ?state.current_backoff,
                "Circuit breaker OPENED"
            );
        } else {
            tracing::debug!(
                breaker = self.name,
                consecutive_failures = state.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Failure recorded - circuit still closed"
            );
        }
    }

    /// Execute an async operation with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.is_call_permitted().await {
            return Err(CircuitBreakerError::Rejected);
        }

        match operation().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, backoff: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                min_backoff: backoff,
                max_backoff: backoff * 4,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker(2, Duration::from_secs(30));
        assert!(breaker.is_call_permitted().await);

        breaker.record_failure().await;
        assert!(breaker.is_call_permitted().await);

        breaker.record_failure().await;
        assert!(!breaker.is_call_permitted().await);

        let result: Result<(), CircuitBreakerError<()>> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Rejected)));
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure().await;
        assert!(!breaker.is_call_permitted().await);

        tokio::time::sleep(Duration::from_millis(25)).await;
        let result: Result<u8, CircuitBreakerError<()>> = breaker.call(|| async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));

        breaker.record_failure().await;
        // One failure after a reset reopens only because the threshold is 1
        assert!(!breaker.is_call_permitted().await);
    }

    #[tokio::test]
    async fn test_inner_errors_pass_through() {
        let breaker = breaker(3, Duration::from_secs(1));
        let result: Result<(), CircuitBreakerError<&str>> =
            breaker.call(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Inner("boom"))));
    }
}
