//! Bounded polling shared by every readiness and reboot stage.
//!
//! A stage supplies a probe that reports [`Attempt::Ready`],
//! [`Attempt::Pending`] (retry after the policy interval) or
//! [`Attempt::Fatal`] (stop immediately). Sleeping goes through a [`Clock`] so
//! stages can be driven by a fake clock in tests.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

/// Future returned by [`Clock::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of delays between polling attempts.
pub trait Clock: Send + Sync {
    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Clock backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Fixed-interval retry budget for one polling stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Delay between two consecutive attempts.
    pub interval: Duration,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy from an interval and an attempt count.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Creates a policy that polls immediately and then every `interval`
    /// until `window` has elapsed.
    ///
    /// A five minute window at five second spacing yields 61 attempts.
    #[must_use]
    pub fn within(interval: Duration, window: Duration) -> Self {
        let steps = window
            .as_millis()
            .checked_div(interval.as_millis())
            .unwrap_or(0);
        let max_attempts = u32::try_from(steps)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        Self {
            interval,
            max_attempts,
        }
    }

    const fn effective_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }
}

/// Outcome of a single probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attempt<T, E> {
    /// The stage condition holds.
    Ready(T),
    /// The condition does not hold yet; the payload describes what was seen.
    Pending(E),
    /// The stage cannot succeed; polling stops without spending the budget.
    Fatal(E),
}

/// Failure returned by [`poll_until`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt reported [`Attempt::Pending`].
    Exhausted {
        /// Number of attempts performed.
        attempts: u32,
        /// Condition reported by the final attempt.
        last: E,
    },
    /// A probe reported [`Attempt::Fatal`].
    Aborted(E),
}

/// Runs `probe` until it is ready, fatal, or the policy's attempts run out.
///
/// The first attempt runs immediately; the clock sleeps for the policy
/// interval before each subsequent one. The probe receives the 1-based
/// attempt number.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last pending condition when the
/// budget is spent, or [`RetryError::Aborted`] on a fatal probe result.
pub async fn poll_until<T, E, F, Fut>(
    clock: &dyn Clock,
    policy: RetryPolicy,
    stage: &str,
    mut probe: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: Display,
{
    let max_attempts = policy.effective_attempts();
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match probe(attempt).await {
            Attempt::Ready(value) => {
                debug!(stage, attempt, "stage condition satisfied");
                return Ok(value);
            }
            Attempt::Fatal(err) => {
                warn!(stage, attempt, error = %err, "stage failed permanently");
                return Err(RetryError::Aborted(err));
            }
            Attempt::Pending(condition) => {
                if attempt >= max_attempts {
                    warn!(
                        stage,
                        attempts = attempt,
                        condition = %condition,
                        "stage retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: condition,
                    });
                }
                debug!(
                    stage,
                    attempt,
                    max_attempts,
                    condition = %condition,
                    "stage not ready, retrying"
                );
                clock.sleep(policy.interval).await;
            }
        }
    }
}
