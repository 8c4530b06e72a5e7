//! Bounded poll-until-status loops shared by every provider waiter.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::{Operation, VolumeError};
use crate::provider::{ResourceKind, ResourceStatus, TargetStatus};

/// Default delay between polls for create, attach, and detach waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of polls for create, attach, and detach waits.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
/// Default delay between snapshot completion polls.
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Default number of snapshot completion polls. Large volumes can take tens
/// of minutes to snapshot.
pub const SNAPSHOT_MAX_ATTEMPTS: u32 = 120;

/// Interval and attempt budget for a waiter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollConfig {
    /// Delay between consecutive polls.
    pub interval: Duration,
    /// Maximum number of status reads before giving up.
    pub max_attempts: u32,
}

impl PollConfig {
    /// Creates a poll budget.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Budget used for snapshot completion.
    #[must_use]
    pub const fn snapshot() -> Self {
        Self::new(SNAPSHOT_POLL_INTERVAL, SNAPSHOT_MAX_ATTEMPTS)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_ATTEMPTS)
    }
}

/// Result of a completed wait.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// Target status observed after `attempts` polls.
    Reached {
        /// Polls performed, including the successful one.
        attempts: u32,
    },
    /// Resource entered a terminal failure state.
    Failed {
        /// Polls performed.
        attempts: u32,
        /// Failure label reported by the provider.
        status: String,
    },
    /// Budget ran out before the target was observed.
    Exhausted {
        /// Polls performed.
        attempts: u32,
        /// Last status observed, if any poll ran.
        last_status: Option<ResourceStatus>,
    },
}

impl WaitOutcome {
    /// Converts the outcome of a create, attach, or detach wait into a
    /// result, mapping exhaustion to [`VolumeError::ProvisioningTimeout`].
    pub(crate) fn require<E>(
        self,
        operation: Operation,
        kind: ResourceKind,
        id: &str,
        target: TargetStatus,
    ) -> Result<(), VolumeError<E>>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Reached { .. } => Ok(()),
            Self::Failed { status, .. } => Err(VolumeError::ResourceFailed {
                operation,
                kind,
                id: id.to_owned(),
                status,
            }),
            Self::Exhausted { attempts, .. } => Err(VolumeError::ProvisioningTimeout {
                kind,
                id: id.to_owned(),
                target,
                attempts,
            }),
        }
    }
}

/// Polls `check` until `target` is reached.
///
/// The delay is only applied between polls, so a budget of one attempt reads
/// the status exactly once and returns immediately.
///
/// # Errors
///
/// Returns the first error produced by `check`; check errors are not retried.
pub async fn poll_until<F, Fut, E>(
    poll: PollConfig,
    target: TargetStatus,
    mut check: F,
) -> Result<WaitOutcome, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ResourceStatus, E>>,
{
    let mut last_status = None;
    for attempt in 1..=poll.max_attempts {
        let status = check().await?;
        debug!(attempt, %status, %target, "polled resource status");

        if target.is_reached(&status) {
            return Ok(WaitOutcome::Reached { attempts: attempt });
        }
        if let ResourceStatus::Failed(label) = status {
            return Ok(WaitOutcome::Failed {
                attempts: attempt,
                status: label,
            });
        }

        last_status = Some(status);
        if attempt < poll.max_attempts {
            sleep(poll.interval).await;
        }
    }

    Ok(WaitOutcome::Exhausted {
        attempts: poll.max_attempts,
        last_status,
    })
}
