use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards the broker producer. While open, publishes fail immediately and the
// relay leaves rows in the outbox instead of piling up retries.
//
// Closed -> Open after `failure_threshold` consecutive failures
// Open -> HalfOpen once `timeout` has elapsed since the last failure
// HalfOpen -> Closed after `success_threshold` successes, -> Open on failure
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics registry
    pub fn code(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

impl Inner {
    fn transition_to(&mut self, next: CircuitState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Circuit breaker transition");
        }
        self.state = next;
        self.success_count = 0;
        if next == CircuitState::Closed {
            self.failure_count = 0;
            self.last_failure_time = None;
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("operation failed: {0}")]
    OperationFailed(E),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
            config,
        }
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock().await;

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let cooled_down = inner
            .last_failure_time
            .map(|at| at.elapsed() >= self.config.timeout)
            .unwrap_or(true);

        if cooled_down {
            inner.transition_to(CircuitState::HalfOpen);
            Ok(())
        } else {
            Err(CircuitBreakerError::CircuitOpen)
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => tracing::warn!("Success recorded while circuit is open"),
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;

        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                tracing::warn!(failures = inner.failure_count, "Opening circuit breaker");
                inner.transition_to(CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Failure while half-open, reopening circuit");
                inner.transition_to(CircuitState::Open);
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            timeout,
            success_threshold,
        })
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60), 1);

        for _ in 0..3 {
            assert!(cb.call(async { Err::<(), _>("kafka timeout") }).await.is_err());
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        let rejected = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = breaker(2, Duration::from_secs(60), 1);

        let _ = cb.call(async { Err::<(), _>("x") }).await;
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        let _ = cb.call(async { Err::<(), _>("x") }).await;

        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovers_after_timeout() {
        let cb = breaker(2, Duration::from_millis(50), 1);

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("x") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cb.call(async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(CircuitState::Open.code(), 1);
    }
}
