use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::confluence::{RemoteError, RemoteErrorKind};

/// Waits between attempts. Tests inject [`NoSleep`] so retries stay instant.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Base for the exponential wait after a rate-limit response.
    pub base_delay: Duration,
    /// Wait after any other transient failure.
    pub fixed_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            fixed_delay: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt after `attempt`, or `None` when the failure is
    /// not worth retrying.
    pub fn delay_for(&self, kind: RemoteErrorKind, attempt: usize) -> Option<Duration> {
        match kind {
            RemoteErrorKind::RateLimited => {
                let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
                Some(self.base_delay.saturating_mul(2u32.saturating_pow(exponent)))
            }
            RemoteErrorKind::Transient => Some(self.fixed_delay),
            RemoteErrorKind::Fatal => None,
        }
    }
}

/// Classify an error by the first [`RemoteError`] in its chain. Errors that
/// carry none count as transient.
pub fn classify(error: &anyhow::Error) -> RemoteErrorKind {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<RemoteError>())
        .map(RemoteError::kind)
        .unwrap_or(RemoteErrorKind::Transient)
}

/// Run `operation` up to `policy.max_attempts` times.
pub fn with_retry<T, S, F>(
    policy: &RetryPolicy,
    label: &str,
    sleeper: &S,
    mut operation: F,
) -> Result<T>
where
    S: Sleeper + ?Sized,
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                let kind = classify(&error);
                let delay = policy.delay_for(kind, attempt);
                let Some(delay) = delay.filter(|_| attempt + 1 < max_attempts) else {
                    return Err(error);
                };
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts,
                    ?kind,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {error:#}"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
        }
    }
}
