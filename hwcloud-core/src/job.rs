//! Job - Indirection for APIs that answer with an asynchronous job
//!
//! Mutating calls such as "create server" or "extend volume" often return a
//! job ID instead of the resource. The job is polled to a terminal state with
//! the same watcher used for resources; on success the resource identifier
//! is pulled out of the job payload so the caller can start a second wait on
//! the resource itself.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::refresh::{Observation, RefreshError};
use crate::wait::{Converged, StateChangeConf, WaitError};

/// Lifecycle of a server-side job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} failed: {reason}")]
    Failed { job_id: String, reason: String },

    #[error("Job {job_id} succeeded but carries no resource ID")]
    MissingResourceId { job_id: String },

    #[error("Error waiting for job {job_id}: {source}")]
    Wait {
        job_id: String,
        #[source]
        source: WaitError,
    },

    #[error("Error reading job {job_id}: {source}")]
    Resolve {
        job_id: String,
        #[source]
        source: RefreshError,
    },
}

/// Service-specific access to job details
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Raw job payload as returned by the service
    type Job: Clone + Send + Sync + 'static;

    /// Fetch the job once; must not retry
    async fn fetch(&self, job_id: &str) -> Result<Self::Job, RefreshError>;

    /// Translate the service's job status vocabulary
    fn status(&self, job: &Self::Job) -> JobStatus;

    fn failure_reason(&self, job: &Self::Job) -> Option<String>;

    /// Identifier of the resource the job produced
    ///
    /// May perform additional reads (e.g. following sub-jobs).
    async fn resource_id(&self, job: &Self::Job) -> Result<Option<String>, RefreshError>;
}

/// Timing for a job wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobTiming {
    pub delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl JobTiming {
    pub fn new(timeout: Duration) -> Self {
        Self {
            delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            timeout,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle on one server-side job
///
/// Once the job reached a terminal state the payload is cached and further
/// resolution never touches the service again.
#[derive(Debug, Clone)]
pub struct JobHandle<J> {
    id: String,
    terminal: Option<(JobStatus, J)>,
}

impl<J: Clone + Send + Sync + 'static> JobHandle<J> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            terminal: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn terminal_status(&self) -> Option<JobStatus> {
        self.terminal.as_ref().map(|(status, _)| *status)
    }

    /// Poll the job until it succeeds or fails
    pub async fn resolve<K>(
        &mut self,
        tracker: &K,
        timing: JobTiming,
        cancel: &CancellationToken,
    ) -> Result<(JobStatus, J), JobError>
    where
        K: JobTracker<Job = J>,
    {
        if let Some(terminal) = &self.terminal {
            return Ok(terminal.clone());
        }

        let job_id = self.id.clone();
        let conf = StateChangeConf::builder()
            .pending([JobStatus::Queued, JobStatus::Running])
            .target([JobStatus::Succeeded, JobStatus::Failed])
            .delay(timing.delay)
            .poll_interval(timing.poll_interval)
            .timeout(timing.timeout)
            .build()
            .map_err(|source| JobError::Wait {
                job_id: job_id.clone(),
                source,
            })?;

        let id = job_id.as_str();
        let refresh = move || async move {
            let job = tracker.fetch(id).await?;
            let status = tracker.status(&job);
            Ok::<_, RefreshError>(Observation::found(job, status))
        };

        let converged = conf
            .wait_with_cancellation(refresh, cancel)
            .await
            .map_err(|source| JobError::Wait {
                job_id: job_id.clone(),
                source,
            })?;

        let terminal = match converged {
            Converged::Reached { snapshot, status } => (status, snapshot),
            Converged::Gone => {
                return Err(JobError::Wait {
                    job_id,
                    source: WaitError::NotFound { retries: 0 },
                });
            }
        };
        log::debug!("Job {} finished with status {}", self.id, terminal.0);
        self.terminal = Some(terminal.clone());
        Ok(terminal)
    }

    /// Wait for the job and extract the identifier of the resource it made
    pub async fn wait_for_resource_id<K>(
        &mut self,
        tracker: &K,
        timing: JobTiming,
        cancel: &CancellationToken,
    ) -> Result<String, JobError>
    where
        K: JobTracker<Job = J>,
    {
        let job = self.wait_for_success(tracker, timing, cancel).await?;

        let resource_id = tracker
            .resource_id(&job)
            .await
            .map_err(|source| JobError::Resolve {
                job_id: self.id.clone(),
                source,
            })?;

        match resource_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(JobError::MissingResourceId {
                job_id: self.id.clone(),
            }),
        }
    }

    /// Wait for the job, turning a failed job into [`JobError::Failed`]
    pub async fn wait_for_success<K>(
        &mut self,
        tracker: &K,
        timing: JobTiming,
        cancel: &CancellationToken,
    ) -> Result<J, JobError>
    where
        K: JobTracker<Job = J>,
    {
        let (status, job) = self.resolve(tracker, timing, cancel).await?;
        if status == JobStatus::Failed {
            return Err(JobError::Failed {
                job_id: self.id.clone(),
                reason: tracker
                    .failure_reason(&job)
                    .unwrap_or_else(|| "unknown reason".to_string()),
            });
        }
        Ok(job)
    }
}
