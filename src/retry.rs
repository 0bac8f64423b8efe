//! Bounded retries with exponential backoff for external calls.
//!
//! Every broker call made by the engine (valuation, quotes, order placement,
//! order status) goes through [`with_retry`]. Transient failures are retried
//! after `base_delay * 2^(attempt-1)`; anything else fails on the spot.

use std::fmt;
use std::time::Duration;

use copytrade_broker::BrokerError;
use log::warn;

/// Suspension point used by the retry loop, the settlement wait and the
/// watch loop. Tests substitute a recording fake.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Failure classification for the retry loop.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

/// How many times to try and how long to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the attempt that follows failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Non-transient failure; the operation was not repeated.
    Rejected { cause: E },
    /// Every attempt failed transiently; carries the last cause.
    Exhausted { attempts: u32, cause: E },
}

impl<E> RetryError<E> {
    pub fn cause(&self) -> &E {
        match self {
            RetryError::Rejected { cause } | RetryError::Exhausted { cause, .. } => cause,
        }
    }

    pub fn into_cause(self) -> E {
        match self {
            RetryError::Rejected { cause } | RetryError::Exhausted { cause, .. } => cause,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Rejected { .. } => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Rejected { cause } => write!(f, "{cause} (not retried)"),
            RetryError::Exhausted { attempts, cause } => {
                write!(f, "{cause} (gave up after {attempts} attempts)")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause())
    }
}

/// Run `op` until it succeeds, fails non-transiently, or `policy.max_attempts`
/// attempts have been made.
pub fn with_retry<T, E, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Transient + fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(cause) if !cause.is_transient() => {
                return Err(RetryError::Rejected { cause });
            }
            Err(cause) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    cause,
                });
            }
            Err(cause) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{label} failed (attempt {attempt}/{max_attempts}): {cause}; retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
        }
    }
}
