//! Retry policy and the attempt loop.
//!
//! # Design
//! A dispatch walks `Attempting(0) → Attempting(1) → …` until an attempt
//! succeeds or the policy is exhausted. `Attempts::Limited(n)` allows `n`
//! retries after the first attempt (n + 1 attempts in total);
//! `Attempts::Unbounded` keeps going until success, bounded only by the
//! optional overall `deadline`. Only retryable errors (transport failures)
//! move the loop forward; anything else ends it immediately.
//!
//! The default policy retries immediately with no backoff. That suits
//! transient local-network failures; callers talking to remote services
//! should configure `Backoff::Exponential`.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How many attempts a dispatch may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// Number of retries after the first attempt.
    Limited(u32),
    /// Retry until an attempt succeeds.
    Unbounded,
}

/// Delay inserted before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `initial * 2^retry`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: Attempts,
    pub backoff: Backoff,
    /// Randomize each delay uniformly within `[0, delay]`.
    pub jitter: bool,
    /// Wall-clock cap across every attempt and delay.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self::limited(0)
    }

    pub fn limited(retries: u32) -> Self {
        Self {
            attempts: Attempts::Limited(retries),
            backoff: Backoff::None,
            jitter: false,
            deadline: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            attempts: Attempts::Unbounded,
            ..Self::once()
        }
    }

    /// Build from the integer retry count used by configuration files:
    /// `0` runs once, `n > 0` allows `n` retries, `-1` retries until success.
    pub fn from_count(retries: i32) -> Result<Self> {
        match retries {
            -1 => Ok(Self::unbounded()),
            n if n >= 0 => Ok(Self::limited(n as u32)),
            n => Err(Error::Config(format!("retries must be -1 or >= 0, got {n}"))),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether attempt `index` (0-based) may run.
    pub fn allows(&self, index: u32) -> bool {
        match self.attempts {
            Attempts::Limited(retries) => index <= retries,
            Attempts::Unbounded => true,
        }
    }

    /// Delay before attempt `index`; the first attempt never waits.
    pub fn delay_before(&self, index: u32) -> Duration {
        if index == 0 {
            return Duration::ZERO;
        }
        let base = match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(index - 1);
                initial.saturating_mul(factor).min(max)
            }
        };
        if self.jitter && !base.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
            Duration::from_millis(millis)
        } else {
            base
        }
    }
}

enum RetryState<T> {
    Attempting(u32),
    Succeeded(T),
    Exhausted(Error),
}

/// Run `attempt` under `policy`.
///
/// `attempt` receives the 0-based attempt index. `can_retry` is consulted
/// after every retryable failure; returning `false` (e.g. because a streamed
/// body was already consumed) ends the loop with the last error.
pub(crate) fn run<T>(
    policy: &RetryPolicy,
    mut attempt: impl FnMut(u32) -> Result<T>,
    mut can_retry: impl FnMut() -> bool,
) -> Result<T> {
    let started = Instant::now();
    let mut state = RetryState::Attempting(0);
    loop {
        state = match state {
            RetryState::Attempting(index) => match attempt(index) {
                Ok(value) => RetryState::Succeeded(value),
                Err(err) if !err.is_retryable() => RetryState::Exhausted(err),
                Err(err) => {
                    let next = next_attempt(index);
                    warn!(attempt = index, error = %err, "request attempt failed");
                    if !policy.allows(next) {
                        debug!(attempts = next, "retries exhausted");
                        RetryState::Exhausted(err)
                    } else if !can_retry() {
                        warn!("request body cannot be replayed, giving up");
                        RetryState::Exhausted(err)
                    } else {
                        let delay = policy.delay_before(next);
                        match policy.deadline {
                            Some(deadline) if started.elapsed() + delay >= deadline => {
                                RetryState::Exhausted(deadline_error(deadline, next, err))
                            }
                            _ => {
                                if !delay.is_zero() {
                                    debug!(attempt = next, delay_ms = delay.as_millis() as u64, "backing off");
                                    std::thread::sleep(delay);
                                }
                                RetryState::Attempting(next)
                            }
                        }
                    }
                }
            },
            RetryState::Succeeded(value) => return Ok(value),
            RetryState::Exhausted(err) => return Err(err),
        };
    }
}

/// Index of the attempt after `index`. Pinned at `u32::MAX` so an unbounded
/// policy keeps going instead of overflowing.
fn next_attempt(index: u32) -> u32 {
    index.saturating_add(1)
}

fn deadline_error(deadline: Duration, attempts: u32, err: Error) -> Error {
    match err {
        Error::Transport(last) => Error::DeadlineExceeded {
            deadline,
            attempts,
            last,
        },
        other => other,
    }
}
