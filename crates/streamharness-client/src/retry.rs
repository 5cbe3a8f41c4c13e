//! Retry Logic for Broker Operations
//!
//! This module implements bounded retry for operations that can fail transiently,
//! most importantly establishing a broker connection at startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  connect()   │ Connection supervisor
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_attempts: 10          │
//! │  - delay: 5s                 │
//! │  - backoff: Fixed            │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 5s
//!        ├─→ Attempt 3: Wait 5s
//!        ├─→ ...
//!        └─→ Attempt 10: Wait 5s, then give up
//! ```
//!
//! ## Backoff Strategies
//!
//! - **Fixed** (default): the same delay between every attempt.
//! - **Exponential**: `delay * multiplier^n`, capped at `max_delay`, with
//!   optional ±25% jitter to avoid many clients reconnecting in lockstep.
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! Classification is delegated to [`ClientError::is_retryable`]. A
//! non-retryable error ends the loop immediately, regardless of how many
//! attempts remain.
//!
//! ## Examples
//!
//! ```ignore
//! use streamharness_client::retry::{RetryPolicy, retry_with_backoff};
//!
//! let policy = RetryPolicy::default(); // 10 attempts, 5s apart
//!
//! let outcome = retry_with_backoff(&policy, |attempt| async move {
//!     client.connect(&settings).await
//! }).await?;
//! println!("connected after {} attempts", outcome.attempts);
//! ```

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed,

    /// Exponential growth from the base delay.
    ///
    /// ```text
    /// delay(n) = min(base * multiplier^n, max_delay)
    /// jittered = delay(n) * (0.75 + random(0.0, 0.5))
    /// ```
    Exponential {
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound on a single delay
        max_delay: Duration,
        /// Apply ±25% random jitter
        jitter: bool,
    },
}

/// Retry policy configuration.
///
/// # Fields
///
/// * `max_attempts` - Total attempts including the first one (default: 10)
/// * `delay` - Base delay between attempts (default: 5s)
/// * `backoff` - Delay strategy (default: `Backoff::Fixed`)
///
/// # Examples
///
/// ```ignore
/// // Startup connection policy
/// let policy = RetryPolicy::default();
///
/// // Aggressive reconnect with jitter
/// let policy = RetryPolicy::exponential(
///     8,
///     Duration::from_millis(200),
///     2.0,
///     Duration::from_secs(10),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first attempt included)
    pub max_attempts: usize,

    /// Base delay between attempts
    pub delay: Duration,

    /// Delay strategy
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 10 attempts, 5 seconds apart, no growth.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a fixed-delay policy.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Create an exponential policy with jitter enabled.
    pub fn exponential(
        max_attempts: usize,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            delay: initial_delay,
            backoff: Backoff::Exponential {
                multiplier,
                max_delay,
                jitter: true,
            },
        }
    }

    /// Delay to wait after the failed attempt with index `retry` (0-indexed).
    ///
    /// Jitter is not applied here; see [`RetryPolicy::jittered_delay`].
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.delay(0), Duration::from_secs(5));
    /// assert_eq!(policy.delay(7), Duration::from_secs(5));
    /// ```
    pub fn delay(&self, retry: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
                ..
            } => {
                let delay_ms = self.delay.as_millis() as f64 * multiplier.powi(retry as i32);
                if !delay_ms.is_finite() || delay_ms >= max_delay.as_millis() as f64 {
                    return max_delay;
                }
                Duration::from_millis(delay_ms as u64)
            }
        }
    }

    /// Delay including jitter, if the strategy asks for it.
    pub fn jittered_delay(&self, retry: usize) -> Duration {
        let base = self.delay(retry);
        match self.backoff {
            Backoff::Exponential { jitter: true, .. } => {
                let factor = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
                Duration::from_millis((base.as_millis() as f64 * factor) as u64)
            }
            _ => base,
        }
    }
}

/// Successful result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value returned by the successful attempt
    pub value: T,
    /// Number of attempts made, including the successful one
    pub attempts: usize,
}

/// All attempts failed, or a non-retryable error stopped the loop.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct RetryError {
    /// Number of attempts made
    pub attempts: usize,
    /// Error returned by the last attempt
    #[source]
    pub source: ClientError,
}

/// Retry an operation according to `policy`.
///
/// The closure receives the 1-indexed attempt number. Each attempt must build
/// its own resources; nothing from a failed attempt is reused.
///
/// # Behavior
///
/// 1. Run the operation
/// 2. On success, return the value and the attempt count
/// 3. On a non-retryable error, return it immediately
/// 4. If attempts remain, sleep the policy delay and go to 1
/// 5. Otherwise return the last error
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => {
                if !error.is_retryable() {
                    warn!(attempt, error = %error, "Non-retryable error, giving up");
                    return Err(RetryError {
                        attempts: attempt,
                        source: error,
                    });
                }

                if attempt >= max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %error,
                        "Max attempts exhausted, giving up"
                    );
                    return Err(RetryError {
                        attempts: attempt,
                        source: error,
                    });
                }

                let delay = policy.jittered_delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn refused() -> ClientError {
        ClientError::Connection("localhost:5552".to_string(), "connection refused".to_string())
    }

    // ========================================================================
    // RetryPolicy - defaults and delays
    // ========================================================================

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.backoff, Backoff::Fixed);
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));
        for retry in 0..10 {
            assert_eq!(policy.delay(retry), Duration::from_secs(5));
            assert_eq!(policy.jittered_delay(retry), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
                jitter: false,
            },
        };

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10)); // Capped
        assert_eq!(policy.delay(1000), Duration::from_secs(10)); // Still capped
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(400),
            1.0,
            Duration::from_secs(60),
        );

        for _ in 0..100 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_millis(300), "{delay:?}");
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
    }

    #[test]
    fn test_policy_serde() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10), 2.0, Duration::from_secs(1));
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    // ========================================================================
    // retry_with_backoff - async tests on the paused clock
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success() {
        let policy = RetryPolicy::default();
        let start = tokio::time::Instant::now();

        let outcome = retry_with_backoff(&policy, |_| async { Ok::<i32, ClientError>(42) })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success_waits_fixed_delay() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let start = tokio::time::Instant::now();

        let outcome = retry_with_backoff(&policy, |_| {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(refused())
                } else {
                    Ok("connected")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.value, "connected");
        assert_eq!(outcome.attempts, 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // Three failures, three 5s waits
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let start = tokio::time::Instant::now();

        let err = retry_with_backoff(&policy, |_| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(refused())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 10);
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        // No sleep after the final attempt
        assert_eq!(start.elapsed(), Duration::from_secs(45));
        assert!(err.source.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let err = retry_with_backoff(&policy, |_| {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err::<(), _>(refused())
                } else {
                    Err(ClientError::Authentication("guest".to_string()))
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.source, ClientError::Authentication("guest".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_numbers_passed_to_operation() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _ = retry_with_backoff(&policy, |attempt| {
            seen_clone.lock().unwrap().push(attempt);
            async { Err::<(), _>(refused()) }
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::fixed(0, Duration::from_secs(5));
        let err = retry_with_backoff(&policy, |_| async { Err::<(), _>(refused()) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserves_last_error() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let err = retry_with_backoff(&policy, |attempt| async move {
            Err::<(), _>(ClientError::Connection(
                "localhost:5552".to_string(),
                format!("attempt {attempt}"),
            ))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.source,
            ClientError::Connection("localhost:5552".to_string(), "attempt 3".to_string())
        );
    }
}
