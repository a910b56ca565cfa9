//! Connection Retry
//!
//! Retries transient database failures with exponential backoff and random
//! jitter. Only errors the caller classifies as transient are retried; every
//! other error is returned on first failure.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay, jitter included
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// A policy that never waits; used by tests and one-shot tools.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential delay for a retry attempt, before jitter.
    pub fn base_delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay for a retry attempt with jitter applied, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        let total = Duration::from_millis((base.as_millis() as f64 + extra) as u64);
        total.min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    pub async fn retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_transient(&err) {
                        debug!("Non-transient error, not retrying: {}", err);
                        return Err(RetryError::Permanent(err));
                    }
                    if attempt >= self.max_retries {
                        warn!("Giving up after {} attempts: {}", attempt + 1, err);
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "Transient error (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// First non-transient error, returned without retrying.
    Permanent(E),
    /// Every attempt failed with a transient error.
    Exhausted { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let policy = RetryPolicy::immediate(3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = policy
            .retry(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err::<u32, _>("connection reset".to_string())
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = policy
            .retry(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("syntax error at or near \"FORM\"".to_string())
                    }
                },
                |e: &String| e.contains("reset"),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_reports_attempts() {
        let policy = RetryPolicy::immediate(2);
        let result = policy
            .retry(|| async { Err::<(), _>("timeout".to_string()) }, |_| true)
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "timeout");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert!(policy.base_delay_for_attempt(1) > policy.base_delay_for_attempt(0));
        assert_eq!(policy.base_delay_for_attempt(8), Duration::from_millis(1000));
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(1000));
            assert!(policy.delay_for_attempt(attempt) >= policy.base_delay_for_attempt(attempt));
        }
    }
}
