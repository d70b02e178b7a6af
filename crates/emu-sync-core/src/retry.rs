//! Retry with exponential backoff and jitter
//!
//! Attempt `n` (zero-based) that fails waits `base * 2^n` plus a uniform
//! jitter in `[0, base)` before the next attempt. The wait observes a
//! [`CancelToken`] and aborts as soon as it fires.

use std::time::Duration;

use backoff::backoff::Backoff;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;

/// How many times to retry a failing operation, and how long to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first; 0 means a single attempt
    pub max_retries: u32,
    /// Unit of the exponential schedule
    #[serde(with = "millis")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// The delay schedule for one operation
    pub fn schedule(&self) -> JitteredDoubling {
        JitteredDoubling {
            attempt: 0,
            max_retries: self.max_retries,
            base: self.base_delay,
        }
    }
}

/// Doubling delays with additive jitter, ending after `max_retries` waits
#[derive(Debug, Clone)]
pub struct JitteredDoubling {
    attempt: u32,
    max_retries: u32,
    base: Duration,
}

impl Backoff for JitteredDoubling {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let exponential = self.base.saturating_mul(1u32 << self.attempt.min(31));
        let jitter = self.base.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        self.attempt += 1;
        Some(exponential.saturating_add(jitter))
    }
}

/// Outcome of an operation that never succeeded
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Cancellation fired before the operation could succeed
    #[error("cancelled")]
    Cancelled,

    /// Every attempt failed; carries the most recent failure
    #[error("failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// The first attempt happens immediately unless the token is already
/// cancelled.
pub fn with_backoff<T, E, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Result<T, E>,
{
    let mut schedule = policy.schedule();
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempts += 1;
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(delay) = schedule.next_backoff() else {
            return Err(RetryError::Exhausted {
                attempts,
                source: err,
            });
        };
        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        if cancel.wait_timeout(delay) {
            return Err(RetryError::Cancelled);
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;
    use std::time::Instant;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_base_delay(Duration::from_millis(1))
    }

    fn flaky(failures: u32, calls: &Cell<u32>) -> impl FnMut() -> io::Result<&'static str> + '_ {
        move || {
            calls.set(calls.get() + 1);
            if calls.get() <= failures {
                Err(io::Error::other(format!("failure {}", calls.get())))
            } else {
                Ok("done")
            }
        }
    }

    #[test]
    fn succeeds_first_try() {
        let calls = Cell::new(0);
        let out = with_backoff(&fast(3), &CancelToken::new(), flaky(0, &calls)).unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_until_success() {
        let calls = Cell::new(0);
        with_backoff(&fast(3), &CancelToken::new(), flaky(2, &calls)).unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let calls = Cell::new(0);
        let err = with_backoff(&fast(0), &CancelToken::new(), flaky(5, &calls)).unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, RetryError::Exhausted { attempts: 1, .. }));
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let err = with_backoff(&fast(2), &CancelToken::new(), flaky(10, &calls)).unwrap_err();
        assert_eq!(calls.get(), 3);
        match err {
            RetryError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "failure 3");
            }
            RetryError::Cancelled => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn cancellation_interrupts_the_delay() {
        let cancel = CancelToken::new();
        let policy = RetryPolicy::new(5).with_base_delay(Duration::from_secs(60));
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });

        let start = Instant::now();
        let calls = Cell::new(0);
        let err = with_backoff(&policy, &cancel, flaky(10, &calls)).unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.get(), 1);
        assert!(start.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
    }

    #[test]
    fn already_cancelled_makes_no_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = Cell::new(0);
        let err = with_backoff(&fast(3), &cancel, flaky(0, &calls)).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn schedule_doubles_with_bounded_jitter() {
        let base = Duration::from_millis(100);
        let mut schedule = RetryPolicy::new(4).with_base_delay(base).schedule();
        for attempt in 0..4u32 {
            let delay = schedule.next_backoff().unwrap();
            let floor = base * 2u32.pow(attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay < floor + base, "attempt {attempt}: {delay:?} too large");
        }
        assert_eq!(schedule.next_backoff(), None);
    }
}
