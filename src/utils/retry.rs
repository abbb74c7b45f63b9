use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Exponential Backoff Retry
// ============================================================================
//
// Used by the outbox relay (broker publish) and by the dispatcher when a
// broker message fails to process. Callers decide what counts as transient;
// nothing here inspects error types on its own.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Publishing outbox rows: more attempts, the row is not going anywhere
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Processing a consumed message: give up quickly and leave it uncommitted
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let next = Duration::from_millis((current.as_millis() as f64 * self.multiplier) as u64);
        next.min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Gave up after `max_attempts`
    Failed(E),
    /// Gave up immediately, the error was not transient
    PermanentFailure(E),
}

/// Errors that know whether another attempt could succeed
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Retry every error until attempts run out
pub async fn retry_with_backoff<F, Fut, T, E>(config: RetryConfig, operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(config, operation, |_| true).await
}

/// Retry only errors reporting themselves as transient
pub async fn retry_on_transient<F, Fut, T, E>(config: RetryConfig, operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    run(config, operation, |e: &E| e.is_transient()).await
}

async fn run<F, Fut, T, E, P>(config: RetryConfig, mut operation: F, retryable: P) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(value);
            }
            Err(error) => error,
        };

        if !retryable(&error) {
            tracing::error!(error = %error, "Permanent failure, not retrying");
            return RetryResult::PermanentFailure(error);
        }

        if attempt >= config.max_attempts {
            tracing::error!(
                attempt = attempt,
                error = %error,
                "Operation failed after all retries"
            );
            return RetryResult::Failed(error);
        }

        tracing::warn!(
            attempt = attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying after delay"
        );

        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}
