//! # Retry and Backoff
//!
//! Purpose: Re-run an operation after transport failures with a bounded
//! number of attempts and a pluggable delay schedule.
//!
//! ## Design Principles
//! 1. **Single Classification Point**: `ClientError::is_retryable` decides
//!    what is retried; application errors pass through untouched.
//! 2. **Strategy Pattern**: `Backoff` is a value, so callers swap constant,
//!    exponential or jittered schedules without touching the loop.
//! 3. **Bounded Work**: At most `max_retries + 1` attempts per call.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ClientError, ClientResult};

/// Backoff schedule selector used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
    ExponentialJitter,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Uniform in `[0, exponential delay]`.
    ExponentialJitter { base: Duration, max: Duration },
}

impl Backoff {
    pub fn from_kind(kind: BackoffKind, base: Duration, max: Duration) -> Self {
        match kind {
            BackoffKind::Constant => Backoff::Constant(base),
            BackoffKind::Exponential => Backoff::Exponential { base, max },
            BackoffKind::ExponentialJitter => Backoff::ExponentialJitter { base, max },
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Constant(delay) => delay,
            Backoff::Exponential { base, max } => exponential(base, max, retry),
            Backoff::ExponentialJitter { base, max } => {
                let ceiling = exponential(base, max, retry).as_millis() as u64;
                if ceiling == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
            }
        }
    }
}

fn exponential(base: Duration, max: Duration, retry: u32) -> Duration {
    let shift = retry.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
}

/// Bounded retry loop around one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Constant(Duration::from_millis(100)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        RetryPolicy { max_retries, backoff }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        RetryPolicy::new(0, Backoff::Constant(Duration::ZERO))
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// `max_retries + 1` attempts have been made.
    ///
    /// The closure receives the 1-based attempt number.
    ///
    /// # Errors
    /// Non-retryable errors are returned as-is. Exhaustion returns
    /// `ClientError::Transport` wrapping the last failure.
    pub fn execute<T, F>(&self, op: &str, mut attempt: F) -> ClientResult<T>
    where
        F: FnMut(u32) -> ClientResult<T>,
    {
        let attempts = self.max_retries.saturating_add(1);
        let mut n = 1;
        loop {
            let err = match attempt(n) {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            if n >= attempts {
                warn!(op, attempts, error = %err, "retries exhausted");
                return Err(ClientError::Transport {
                    attempts,
                    source: Box::new(err),
                });
            }
            let delay = self.backoff.delay(n);
            warn!(
                op,
                attempt = n,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transport failure, retrying"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn reset() -> ClientError {
        ClientError::Io(io::Error::from(io::ErrorKind::ConnectionReset))
    }

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Backoff::Constant(Duration::from_millis(1)))
    }

    #[test]
    fn exhaustion_makes_max_retries_plus_one_attempts() {
        let mut calls = 0;
        let result: ClientResult<()> = fast(3).execute("get", |_| {
            calls += 1;
            Err(reset())
        });
        assert_eq!(calls, 4);
        match result {
            Err(ClientError::Transport { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, ClientError::Io(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn application_errors_are_not_retried() {
        let mut calls = 0;
        let result: ClientResult<()> = fast(5).execute("get", |_| {
            calls += 1;
            Err(ClientError::not_found("k"))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(ClientError::NotFound { .. })));
    }

    #[test]
    fn recovers_after_transient_failure() {
        let result = fast(2).execute("put", |attempt| {
            if attempt < 3 {
                Err(reset())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn no_retry_policy_still_wraps_transport_failure() {
        let result: ClientResult<()> = RetryPolicy::no_retry().execute("del", |_| Err(reset()));
        assert!(matches!(result, Err(ClientError::Transport { attempts: 1, .. })));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(40), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        let backoff = Backoff::from_kind(
            BackoffKind::ExponentialJitter,
            Duration::from_millis(8),
            Duration::from_millis(100),
        );
        for retry in 1..6 {
            let ceiling = Duration::from_millis(8 << (retry - 1)).min(Duration::from_millis(100));
            assert!(backoff.delay(retry) <= ceiling);
        }
    }
}
