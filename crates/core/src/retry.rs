use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors that may succeed if the same call is made again.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }
}

/// Exponential backoff with optional jitter, shared by every fallible
/// boundary and configured per boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls including the first; at least one is always made.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0–1.0) of each delay that may be randomly shaved off.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Extraction service calls.
    pub fn service_default() -> Self {
        Self::new(4, Duration::from_millis(500), Duration::from_secs(8), 0.2)
    }

    /// Staging writes.
    pub fn store_default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(2), 0.2)
    }

    /// Retries back to back.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay);
        if self.jitter > 0.0 {
            delay.mul_f64(1.0 - self.jitter * rand::random::<f64>())
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt ceiling
    /// is reached. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, boundary: &'static str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let delay = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(boundary, attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        boundary,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    delay
                }
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350), 0.0);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_only_shortens() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 0.5);
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d <= Duration::from_millis(100) && d >= Duration::from_millis(50), "{d:?}");
        }
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = RetryPolicy::immediate(3)
            .run("test", move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(true))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_at_ceiling() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("test", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn passes_attempt_number() {
        let mut seen = Vec::new();
        let _: Result<(), _> = RetryPolicy::immediate(3)
            .run("test", |attempt| {
                seen.push(attempt);
                async { Err(Flaky(true)) }
            })
            .await;
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
