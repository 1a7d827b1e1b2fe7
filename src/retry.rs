use std::fmt;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;

/// Bounded retry with exponential backoff and pseudo-random jitter.
///
/// One policy drives every retry loop in the load path: provisioning
/// conflicts, rate-limited deletes and inserts against a table whose metadata
/// has not propagated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop early.
    Aborted(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempt(s): {last}")
            }
            RetryError::Aborted(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// `max_attempts` tries with no waiting in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Wait before retrying after the failed `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff(self, attempt, jitter_seed())
    }

    /// Runs `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or the attempt budget runs out. `op` receives the 0-based
    /// attempt number.
    pub fn run<T, E, F, P>(&self, label: &str, is_retryable: P, mut op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(RetryError::Aborted(err)),
                Err(err) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    let wait = self.delay(attempt);
                    warn!(
                        "{label}: attempt {}/{} failed ({err}); retrying in {}ms",
                        attempt + 1,
                        self.max_attempts,
                        wait.as_millis()
                    );
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn backoff(policy: &RetryPolicy, attempt: u32, seed: u64) -> Duration {
    let exp = 1u64 << attempt.min(8);
    let base_ms = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX);
    let without_jitter = base_ms.saturating_mul(exp).min(max_ms);
    if without_jitter == 0 {
        return Duration::ZERO;
    }
    let jitter = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(u64::from(attempt).wrapping_mul(0x9E3779B97F4A7C15));
    let jitter_ms = jitter % (without_jitter / 4).max(1);
    Duration::from_millis(without_jitter.saturating_add(jitter_ms))
}

fn jitter_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or_default()
}
