//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use packsmith_common::PackError;

/// Retry limits for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Growth factor between delays.
    pub multiplier: u32,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
    /// Time limit for each attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Fresh attempt state.
    #[must_use]
    pub const fn start(&self) -> Attempts {
        Attempts {
            policy: *self,
            attempt: 0,
            next_backoff: self.initial_backoff,
        }
    }
}

/// Attempt counter and backoff state of one task.
#[derive(Debug, Clone)]
pub struct Attempts {
    policy: RetryPolicy,
    attempt: u32,
    next_backoff: Duration,
}

impl Attempts {
    /// Start the next attempt; returns its 1-based number.
    pub const fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Attempts started so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.next_backoff;
        self.next_backoff = delay
            .saturating_mul(self.policy.multiplier)
            .min(self.policy.max_backoff);
        Some(delay)
    }
}

/// How a retried operation ended without success.
#[derive(Debug)]
pub enum RetryError {
    /// Failure that retrying cannot fix.
    Fatal(PackError),
    /// Transient failures up to the attempt ceiling.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure seen.
        last: PackError,
    },
}

/// Run `operation` until it succeeds, fails fatally or runs out of attempts.
///
/// Each attempt is bounded by the policy's timeout; an attempt that times
/// out counts as a transient failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut run: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PackError>>,
{
    let mut attempts = policy.start();
    loop {
        let attempt = attempts.begin();
        let result = match tokio::time::timeout(policy.attempt_timeout, run()).await {
            Ok(result) => result,
            Err(_) => Err(PackError::Timeout {
                operation: operation.to_string(),
            }),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(RetryError::Fatal(err)),
            Err(err) => err,
        };

        let Some(delay) = attempts.next_delay() else {
            tracing::warn!(operation, attempts = attempt, error = %err, "Giving up");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        };

        tracing::warn!(
            operation,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn unavailable() -> PackError {
        PackError::Registry {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut attempts = RetryPolicy::default().start();
        let mut delays = Vec::new();
        while attempts.begin() > 0 {
            match attempts.next_delay() {
                Some(d) => delays.push(d.as_millis()),
                None => break,
            }
        }
        assert_eq!(delays, [250, 500, 1000]);
        assert_eq!(attempts.attempt(), 4);

        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(3),
            ..RetryPolicy::default()
        };
        let mut attempts = policy.start();
        let mut delays = Vec::new();
        while attempts.begin() > 0 {
            match attempts.next_delay() {
                Some(d) => delays.push(d.as_secs()),
                None => break,
            }
        }
        assert_eq!(delays, [3, 5, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = with_retry(&RetryPolicy::default(), "pull", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("pulled")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "pulled");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(750));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "pull", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PackError::Unauthorized {
                    registry: "ghcr.io".into(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Fatal(PackError::Unauthorized { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "pull", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(1),
            ..RetryPolicy::default()
        };

        let result: Result<(), _> = with_retry(&policy, "pull slow", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, PackError::Timeout { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
