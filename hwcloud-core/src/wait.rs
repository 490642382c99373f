//! Wait - Generic state change watcher
//!
//! Drives a [`Refresh`] function on a schedule until the observed status
//! reaches a target, an unexpected status or fatal error shows up, or the
//! timeout elapses. The watcher never mutates anything itself; it only
//! invokes the refresh function and sleeps.
//!
//! ```ignore
//! let converged = StateChangeConf::builder()
//!     .pending([ServerStatus::Build])
//!     .target([ServerStatus::Active])
//!     .timeout(timeouts.create)
//!     .delay(Duration::from_secs(5))
//!     .poll_interval(Duration::from_secs(5))
//!     .build()?
//!     .wait(server_refresh(&client, &server_id))
//!     .await?;
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::refresh::{Observation, Refresh, RefreshError, Status};

/// Consecutive not-found observations tolerated before giving up
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

/// Fixed poll intervals at or above this are ignored in favour of backoff
const MAX_FIXED_POLL_INTERVAL: Duration = Duration::from_secs(180);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Errors produced while waiting for a state change
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Invalid poll specification: {0}")]
    InvalidSpec(String),

    /// The refresh function reported a fatal remote-side failure
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("Unexpected state '{state}', wanted target '{}'", expected.join(", "))]
    UnexpectedState { state: String, expected: Vec<String> },

    #[error("Couldn't find resource ({retries} retries)")]
    NotFound { retries: u32 },

    #[error(
        "Timeout while waiting for state to become '{}' (last state: '{}', timeout: {timeout:?})",
        expected.join(", "),
        last_state.as_deref().unwrap_or("")
    )]
    Timeout {
        last_state: Option<String>,
        expected: Vec<String>,
        timeout: Duration,
    },

    #[error("Wait cancelled")]
    Cancelled,
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// How statuses outside the target set are treated
#[derive(Debug, Clone, PartialEq)]
pub enum PendingPolicy<S> {
    /// Only the listed statuses keep the wait going; anything else is unexpected.
    /// An empty list rejects every non-target status.
    Only(Vec<S>),
    /// Every non-target status keeps the wait going
    AnyNonTarget,
}

/// Result of a successful wait
#[derive(Debug, Clone, PartialEq)]
pub enum Converged<T, S> {
    /// A target status was observed (the required number of times)
    Reached { snapshot: T, status: S },
    /// The object disappeared and absence was an accepted target
    Gone,
}

impl<T, S> Converged<T, S> {
    pub fn snapshot(self) -> Option<T> {
        match self {
            Self::Reached { snapshot, .. } => Some(snapshot),
            Self::Gone => None,
        }
    }

    pub fn status(&self) -> Option<&S> {
        match self {
            Self::Reached { status, .. } => Some(status),
            Self::Gone => None,
        }
    }
}

/// Immutable specification of one convergence wait
///
/// Built fresh for every wait and consumed by [`StateChangeConf::wait`].
#[derive(Debug, Clone)]
pub struct StateChangeConf<S> {
    pending: PendingPolicy<S>,
    target: Vec<S>,
    target_not_found: bool,
    delay: Duration,
    poll_interval: Option<Duration>,
    min_timeout: Duration,
    timeout: Duration,
    not_found_checks: u32,
    continuous_target_occurrence: u32,
}

/// Builder for [`StateChangeConf`]
#[derive(Debug, Clone)]
pub struct StateChangeConfBuilder<S> {
    pending: PendingPolicy<S>,
    target: Vec<S>,
    target_not_found: bool,
    delay: Duration,
    poll_interval: Option<Duration>,
    min_timeout: Duration,
    timeout: Option<Duration>,
    not_found_checks: u32,
    continuous_target_occurrence: u32,
}

impl<S: Status> Default for StateChangeConfBuilder<S> {
    fn default() -> Self {
        Self {
            pending: PendingPolicy::Only(Vec::new()),
            target: Vec::new(),
            target_not_found: false,
            delay: Duration::ZERO,
            poll_interval: None,
            min_timeout: Duration::ZERO,
            timeout: None,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            continuous_target_occurrence: 1,
        }
    }
}

impl<S: Status> StateChangeConfBuilder<S> {
    pub fn pending(mut self, pending: impl IntoIterator<Item = S>) -> Self {
        self.pending = PendingPolicy::Only(pending.into_iter().collect());
        self
    }

    /// Keep waiting on any status that is not a target
    pub fn pending_any(mut self) -> Self {
        self.pending = PendingPolicy::AnyNonTarget;
        self
    }

    pub fn target(mut self, target: impl IntoIterator<Item = S>) -> Self {
        self.target = target.into_iter().collect();
        self
    }

    /// Accept a not-found observation as convergence (deletion waits)
    pub fn target_not_found(mut self) -> Self {
        self.target_not_found = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Lower bound for the backoff interval when no fixed interval is set
    pub fn min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences.max(1);
        self
    }

    pub fn build(self) -> Result<StateChangeConf<S>, WaitError> {
        let timeout = self
            .timeout
            .ok_or_else(|| WaitError::InvalidSpec("a timeout is required".to_string()))?;

        if self.target.is_empty() && !self.target_not_found {
            return Err(WaitError::InvalidSpec(
                "at least one target status is required".to_string(),
            ));
        }

        if let PendingPolicy::Only(pending) = &self.pending
            && let Some(overlap) = pending.iter().find(|s| self.target.contains(s))
        {
            return Err(WaitError::InvalidSpec(format!(
                "status '{}' is both pending and target",
                overlap
            )));
        }

        Ok(StateChangeConf {
            pending: self.pending,
            target: self.target,
            target_not_found: self.target_not_found,
            delay: self.delay,
            poll_interval: self.poll_interval,
            min_timeout: self.min_timeout,
            timeout,
            not_found_checks: self.not_found_checks,
            continuous_target_occurrence: self.continuous_target_occurrence,
        })
    }
}

impl<S: Status> StateChangeConf<S> {
    pub fn builder() -> StateChangeConfBuilder<S> {
        StateChangeConfBuilder::default()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until the refresh function reports a target status
    pub async fn wait<T, R>(self, refresh: R) -> Result<Converged<T, S>, WaitError>
    where
        R: Refresh<T, S>,
    {
        self.wait_with_cancellation(refresh, &CancellationToken::new())
            .await
    }

    /// Like [`wait`](Self::wait), but aborts with [`WaitError::Cancelled`]
    /// as soon as `cancel` fires
    pub async fn wait_with_cancellation<T, R>(
        self,
        refresh: R,
        cancel: &CancellationToken,
    ) -> Result<Converged<T, S>, WaitError>
    where
        R: Refresh<T, S>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut last_state: Option<String> = None;
        let mut target_occurrence = 0u32;
        let mut not_found_ticks = 0u32;
        let mut backoff = INITIAL_BACKOFF;
        let mut polls = 0u32;

        log::debug!(
            "Waiting for state to become {:?} (delay: {:?}, timeout: {:?})",
            self.target,
            self.delay,
            self.timeout
        );

        if !self.delay.is_zero() {
            pause_until((start + self.delay).min(deadline), cancel).await?;
        }

        loop {
            if Instant::now() >= deadline {
                return Err(self.timeout_error(last_state));
            }

            let observed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                result = tokio::time::timeout_at(deadline, refresh.refresh()) => match result {
                    Ok(observed) => observed?,
                    Err(_) => return Err(self.timeout_error(last_state)),
                },
            };
            polls += 1;

            match observed {
                Observation::NotFound => {
                    if self.target_not_found {
                        target_occurrence += 1;
                        if target_occurrence >= self.continuous_target_occurrence {
                            log::info!("Resource is gone after {} polls", polls);
                            return Ok(Converged::Gone);
                        }
                    } else {
                        not_found_ticks += 1;
                        if not_found_ticks > self.not_found_checks {
                            return Err(WaitError::NotFound {
                                retries: not_found_ticks,
                            });
                        }
                    }
                    log::debug!("Poll {}: resource not found", polls);
                }
                Observation::Found { snapshot, status } => {
                    not_found_ticks = 0;
                    log::debug!("Poll {}: state is '{}'", polls, status);
                    last_state = Some(status.to_string());

                    if self.target.contains(&status) {
                        target_occurrence += 1;
                        if target_occurrence >= self.continuous_target_occurrence {
                            log::info!("Reached state '{}' after {} polls", status, polls);
                            return Ok(Converged::Reached { snapshot, status });
                        }
                    } else if self.is_pending(&status) {
                        target_occurrence = 0;
                    } else {
                        return Err(WaitError::UnexpectedState {
                            state: status.to_string(),
                            expected: self.expected(),
                        });
                    }
                }
            }

            let pause = self.next_interval(&mut backoff, target_occurrence);
            pause_until((Instant::now() + pause).min(deadline), cancel).await?;
        }
    }

    fn is_pending(&self, status: &S) -> bool {
        match &self.pending {
            PendingPolicy::Only(pending) => pending.contains(status),
            PendingPolicy::AnyNonTarget => true,
        }
    }

    /// Fixed interval when configured, otherwise doubling backoff clamped to
    /// `[min_timeout, 10s]`. The backoff holds still while a target is
    /// being re-observed.
    fn next_interval(&self, backoff: &mut Duration, target_occurrence: u32) -> Duration {
        if let Some(interval) = self.poll_interval
            && !interval.is_zero()
            && interval < MAX_FIXED_POLL_INTERVAL
        {
            return interval;
        }

        if target_occurrence == 0 {
            *backoff = backoff.saturating_mul(2);
        }
        if *backoff < self.min_timeout {
            *backoff = self.min_timeout;
        } else if *backoff > MAX_BACKOFF {
            *backoff = MAX_BACKOFF;
        }
        *backoff
    }

    fn expected(&self) -> Vec<String> {
        self.target.iter().map(|s| s.to_string()).collect()
    }

    fn timeout_error(&self, last_state: Option<String>) -> WaitError {
        WaitError::Timeout {
            last_state,
            expected: self.expected(),
            timeout: self.timeout,
        }
    }
}

async fn pause_until(until: Instant, cancel: &CancellationToken) -> Result<(), WaitError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        _ = tokio::time::sleep_until(until) => Ok(()),
    }
}
