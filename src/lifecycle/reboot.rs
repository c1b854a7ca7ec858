//! Reboot coordination after a kernel argument update.

use std::time::Duration;

use tracing::{debug, info};

use crate::remote::RemoteExecutor;
use crate::retry::{Attempt, Clock, RetryError, RetryPolicy, poll_until};

use super::LifecycleError;

/// Command whose success shows the host answers SSH.
pub const LIVENESS_PROBE: [&str; 3] = ["sh", "-c", "date"];

const REBOOT_COMMAND: [&str; 1] = ["reboot"];
const REBOOT_WINDOW: Duration = Duration::from_secs(300);

/// Polling budgets of the two reboot phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RebootPolicy {
    /// Waiting for the host to stop answering.
    pub down: RetryPolicy,
    /// Waiting for the host to answer again.
    pub up: RetryPolicy,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            down: RetryPolicy::within(Duration::from_secs(5), REBOOT_WINDOW),
            up: RetryPolicy::within(Duration::from_secs(30), REBOOT_WINDOW),
        }
    }
}

/// Reboots a host and waits for it to go down and come back.
pub struct RebootCoordinator<'a> {
    remote: &'a dyn RemoteExecutor,
    clock: &'a dyn Clock,
    policy: RebootPolicy,
}

impl<'a> RebootCoordinator<'a> {
    /// Creates a coordinator with the default policy.
    #[must_use]
    pub fn new(remote: &'a dyn RemoteExecutor, clock: &'a dyn Clock) -> Self {
        Self {
            remote,
            clock,
            policy: RebootPolicy::default(),
        }
    }

    /// Replaces the polling policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RebootPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reboots `host`.
    ///
    /// The reboot request itself may fail because the session drops; that
    /// failure is ignored. Success means a liveness probe failed at least
    /// once and later succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NeverWentDown`] when the host keeps
    /// answering and [`LifecycleError::NeverCameBack`] when it stays
    /// unreachable.
    pub async fn reboot(&self, host: &str) -> Result<(), LifecycleError> {
        info!(instance = host, "rebooting instance");
        if let Err(err) = self.remote.run(host, &REBOOT_COMMAND).await {
            debug!(instance = host, error = %err, "reboot command returned an error");
        }

        poll_until(self.clock, self.policy.down, "reboot-down", |_| async move {
            match self.remote.run(host, &LIVENESS_PROBE).await {
                Ok(_) => Attempt::Pending(String::from("instance still answers SSH")),
                Err(_) => Attempt::Ready(()),
            }
        })
        .await
        .map_err(|err| LifecycleError::NeverWentDown {
            instance: host.to_owned(),
            attempts: attempts_spent(&err, self.policy.down),
        })?;
        debug!(instance = host, "instance went down");

        poll_until(self.clock, self.policy.up, "reboot-up", |_| async move {
            match self.remote.run(host, &LIVENESS_PROBE).await {
                Ok(_) => Attempt::Ready(()),
                Err(err) => Attempt::Pending(err.to_string()),
            }
        })
        .await
        .map_err(|err| {
            let attempts = attempts_spent(&err, self.policy.up);
            let last = match err {
                RetryError::Exhausted { last, .. } | RetryError::Aborted(last) => last,
            };
            LifecycleError::NeverCameBack {
                instance: host.to_owned(),
                attempts,
                last,
            }
        })?;
        info!(instance = host, "instance back after reboot");
        Ok(())
    }
}

const fn attempts_spent<E>(err: &RetryError<E>, policy: RetryPolicy) -> u32 {
    match err {
        RetryError::Exhausted { attempts, .. } => *attempts,
        RetryError::Aborted(_) => policy.max_attempts,
    }
}
