//! Retry - Bounded retry on transient lock contention
//!
//! Some submissions are rejected while a parent resource is busy (CCE answers
//! HTTP 403 while the cluster is locked by another operation). The caller
//! classifies which errors are transient and supplies a recovery step, such
//! as waiting for the parent to become available again, that runs before
//! each resubmission.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Limits for [`retry_transient`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Pause between a recovery step and the next attempt
    pub backoff: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(10),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    /// Transient failures persisted past the policy's limits
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The operation failed with an error that is not worth retrying
    #[error("{0}")]
    Permanent(E),

    /// The recovery step between attempts failed
    #[error("Recovery before retry failed: {0}")]
    Recovery(E),
}

impl<E: fmt::Display + fmt::Debug> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(e) | Self::Recovery(e) => e,
        }
    }
}

/// Run `op`, retrying after `recover` while `is_transient` says so
pub async fn retry_transient<T, E, Op, OpFut, Rec, RecFut>(
    policy: &RetryPolicy,
    mut op: Op,
    is_transient: impl Fn(&E) -> bool,
    mut recover: Rec,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display + fmt::Debug,
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Rec: FnMut() -> RecFut,
    RecFut: Future<Output = Result<(), E>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(RetryError::Permanent(err));
        }

        let out_of_time = policy
            .max_elapsed
            .is_some_and(|max| start.elapsed() + policy.backoff >= max);
        if attempts >= policy.max_attempts || out_of_time {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        log::warn!(
            "Attempt {}/{} hit a transient error, retrying: {}",
            attempts,
            policy.max_attempts,
            err
        );
        recover().await.map_err(RetryError::Recovery)?;
        tokio::time::sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum SubmitError {
        Locked,
        BadRequest,
    }

    impl fmt::Display for SubmitError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                SubmitError::Locked => write!(f, "403 cluster is locked"),
                SubmitError::BadRequest => write!(f, "400 bad flavor"),
            }
        }
    }

    fn is_locked(e: &SubmitError) -> bool {
        *e == SubmitError::Locked
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = &AtomicU32::new(0);
        let recoveries = &AtomicU32::new(0);

        let result = retry_transient(
            &RetryPolicy::new(5).with_backoff(Duration::from_secs(1)),
            move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SubmitError::Locked)
                } else {
                    Ok("job-42")
                }
            },
            is_locked,
            move || async move {
                recoveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), "job-42");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(recoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = &AtomicU32::new(0);

        let err = retry_transient(
            &RetryPolicy::new(3).with_backoff(Duration::from_secs(1)),
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SubmitError::Locked)
            },
            is_locked,
            || async { Ok(()) },
        )
        .await
        .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, SubmitError::Locked);
            }
            other => panic!("Expected exhausted, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_cap_stops_retrying() {
        let attempts = &AtomicU32::new(0);

        let err = retry_transient(
            &RetryPolicy::new(100)
                .with_backoff(Duration::from_secs(10))
                .with_max_elapsed(Duration::from_secs(25)),
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SubmitError::Locked)
            },
            is_locked,
            || async { Ok(()) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let attempts = &AtomicU32::new(0);

        let err = retry_transient(
            &RetryPolicy::default(),
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SubmitError::BadRequest)
            },
            is_locked,
            || async { Ok(()) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "400 bad flavor");
        assert_eq!(err.into_inner(), SubmitError::BadRequest);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_stops_retrying() {
        let err = retry_transient(
            &RetryPolicy::default(),
            || async { Err::<(), _>(SubmitError::Locked) },
            is_locked,
            || async { Err(SubmitError::BadRequest) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Recovery(SubmitError::BadRequest)));
    }
}
