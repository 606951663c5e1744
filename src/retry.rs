//! Retry logic with configurable backoff for connection and command operations.
//!
//! A [`RetryPolicy`] describes how many attempts to make and how long to wait
//! between them; the [`retry`] executor drives an async operation under that
//! policy. Whether a failure is worth retrying is decided by a classifier
//! predicate passed by the caller (see [`crate::connection::classify`]); the
//! loop itself never inspects error messages.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempt indices are clamped here before exponentiation so the shifted
/// multiplier cannot overflow a u64 of milliseconds.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Strategy for calculating the delay before the next retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Linear increase: `initial_delay * (attempt + 1)`.
    Linear,
    /// Exponential increase: `initial_delay * 2^attempt`.
    Exponential,
    /// Exponential with a uniformly random addend in `[0, base/2)`.
    ExponentialWithJitter,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialWithJitter
    }
}

impl BackoffStrategy {
    /// Calculate the raw (uncapped) delay for a 0-based attempt index.
    pub fn calculate_delay(&self, attempt: u32, initial_delay: Duration) -> Duration {
        let base_millis = initial_delay.as_millis() as u64;
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);

        let millis = match self {
            Self::Linear => base_millis.saturating_mul(u64::from(attempt) + 1),
            Self::Exponential => base_millis.saturating_mul(1u64 << exponent),
            Self::ExponentialWithJitter => {
                let base = base_millis.saturating_mul(1u64 << exponent);
                let spread = base / 2;
                if spread == 0 {
                    base
                } else {
                    base.saturating_add(rand::thread_rng().gen_range(0..spread))
                }
            }
        };

        Duration::from_millis(millis)
    }
}

/// Configuration for retry behavior.
///
/// An absent policy (`Option::<RetryPolicy>::None` at the call site) means
/// the operation runs exactly once with no delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means a single attempt, no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cap applied to every computed delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy to use.
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Policy with linear backoff.
    pub fn linear(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        }
    }

    /// Policy with plain exponential backoff.
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay for a 0-based attempt index, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.strategy
            .calculate_delay(attempt, self.initial_delay)
            .min(self.max_delay)
    }
}

/// Final outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier marked the error non-retryable; the operation was not
    /// re-attempted. Also the outcome when no policy was supplied.
    Fatal {
        /// The underlying error.
        error: E,
    },

    /// A retryable error persisted through the configured maximum attempts.
    Exhausted {
        /// Total number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: E,
    },

    /// Cancellation interrupted a retry wait before the next attempt fired.
    Cancelled {
        /// Number of attempts made before cancellation.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// The underlying error, if one was captured.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Fatal { error } => Some(error),
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Cancelled { .. } => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal { error } => write!(f, "{}", error),
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
            Self::Cancelled { attempts } => {
                write!(f, "cancelled after {} attempts", attempts)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fatal { error } => Some(error),
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Run `operation` under `policy`, re-attempting failures the classifier
/// marks as retryable.
///
/// The wait between attempts observes `cancel`; cancellation during a wait
/// aborts the whole call with [`RetryError::Cancelled`] instead of sleeping
/// out the delay. No delay is applied after the final attempt.
pub async fn retry<T, E, F, Fut, C>(
    policy: Option<&RetryPolicy>,
    classifier: C,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let Some(policy) = policy else {
        return operation().await.map_err(|error| RetryError::Fatal { error });
    };

    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                if !classifier(&error) {
                    debug!(%error, "error classified as non-retryable");
                    return Err(RetryError::Fatal { error });
                }
                if attempt >= policy.max_retries {
                    warn!(attempts = attempt + 1, %error, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last_error: error,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt = attempt + 1, ?delay, %error, "retrying after delay");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled { attempts: attempt + 1 });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn always_retryable(_: &String) -> bool {
        true
    }

    #[test]
    fn linear_delay_matches_formula() {
        let d = Duration::from_secs(1);
        for n in 0..10u32 {
            assert_eq!(
                BackoffStrategy::Linear.calculate_delay(n, d),
                Duration::from_secs(u64::from(n) + 1)
            );
        }
    }

    #[test]
    fn exponential_delay_matches_formula() {
        let d = Duration::from_millis(100);
        for n in 0..10u32 {
            assert_eq!(
                BackoffStrategy::Exponential.calculate_delay(n, d),
                Duration::from_millis(100 * (1 << n))
            );
        }
    }

    #[test]
    fn exponent_is_frozen_at_thirty() {
        let d = Duration::from_millis(1);
        let at_30 = BackoffStrategy::Exponential.calculate_delay(30, d);
        assert_eq!(BackoffStrategy::Exponential.calculate_delay(31, d), at_30);
        assert_eq!(BackoffStrategy::Exponential.calculate_delay(100, d), at_30);
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let d = Duration::from_millis(100);
        for n in 0..8u32 {
            let base = Duration::from_millis(100 * (1 << n));
            for _ in 0..50 {
                let delay = BackoffStrategy::ExponentialWithJitter.calculate_delay(n, d);
                assert!(delay >= base, "delay {:?} below base {:?}", delay, base);
                assert!(
                    delay < base + base / 2,
                    "delay {:?} above jitter bound for base {:?}",
                    delay,
                    base
                );
            }
        }
    }

    #[test]
    fn delay_never_exceeds_max_delay() {
        let policy =
            RetryPolicy::exponential(20, Duration::from_secs(1), Duration::from_secs(30));
        for n in 0..20u32 {
            assert!(policy.delay_for_attempt(n) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn linear_policy_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Linear,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn policy_roundtrips_through_yaml() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };
        let yaml = serde_yaml::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, policy);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, _> = retry(Some(&policy), always_retryable, &cancel, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = retry(Some(&policy), always_retryable, &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("still failing".to_string())
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_runs_once() {
        let policy = RetryPolicy::linear(5, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = retry(Some(&policy), |_: &String| false, &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_policy_runs_once() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = retry(None, always_retryable, &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("any".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_wait_aborts() {
        let policy = RetryPolicy::linear(10, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = retry(Some(&policy), always_retryable, &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("transient".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        // Far fewer invocations than the 11 an uncancelled run would make.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
