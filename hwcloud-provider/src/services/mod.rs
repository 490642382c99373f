//! Service modules
//!
//! Each module owns the status vocabulary of one service, the refresh
//! functions that classify its resources, and the submit-then-wait
//! operations built on top of them.

pub mod cce;
pub mod ecs;
pub mod evs;
pub mod vpc;

use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::job::{JobStatus, JobTiming, JobTracker};
use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::refresh::{Refresh, RefreshError, Status};
use hwcloud_core::retry::RetryPolicy;
use hwcloud_core::wait::{Converged, StateChangeConf, WaitError};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, ServiceClient};
use crate::utils::path_str;

/// Shared settings for every wait a provider performs
#[derive(Debug, Clone)]
pub struct WaitContext {
    pub cancel: CancellationToken,
    /// Multiplier applied to delays, poll intervals and retry backoff
    pub scale: f64,
    pub max_retries: u32,
}

impl WaitContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            scale: 1.0,
            max_retries: 5,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Scale a nominal delay; a scale that does not yield a valid duration
    /// leaves it unchanged
    pub fn pace(&self, duration: Duration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() * self.scale).unwrap_or(duration)
    }

    /// Job timing with the usual 5s delay and 10s interval
    pub fn job_timing(&self, timeout: Duration) -> JobTiming {
        JobTiming::new(timeout)
            .with_delay(self.pace(Duration::from_secs(5)))
            .with_poll_interval(self.pace(Duration::from_secs(10)))
    }

    /// Policy for resubmitting requests rejected while a parent is locked
    pub fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_backoff(self.pace(Duration::from_secs(10)))
            .with_max_elapsed(timeout)
    }

    pub async fn wait<T, S, R>(
        &self,
        conf: StateChangeConf<S>,
        refresh: R,
    ) -> Result<Converged<T, S>, WaitError>
    where
        S: Status,
        R: Refresh<T, S>,
    {
        conf.wait_with_cancellation(refresh, &self.cancel).await
    }
}

/// Time left of `timeout` since `started`
pub fn remaining(timeout: Duration, started: Instant) -> Duration {
    timeout.saturating_sub(started.elapsed())
}

/// Identifier of the job a submission started
pub fn submitted_job_id(body: &serde_json::Value, path: &str) -> ProviderResult<String> {
    path_str(body, path)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::new(format!("Response carries no job ID at '{}'", path)))
}

/// Whether a failed submission was rejected with HTTP 403
pub fn is_forbidden(err: &ProviderError) -> bool {
    err.cause
        .as_deref()
        .and_then(|c| c.downcast_ref::<ApiError>())
        .is_some_and(ApiError::is_forbidden)
}

/// Payload of the `/v1/{project_id}/jobs/{job_id}` API shared by ECS and EVS
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceJob {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub entities: serde_json::Value,
    pub fail_reason: Option<String>,
    pub error_code: Option<String>,
}

/// Tracker for ECS/EVS style jobs
pub struct ServiceJobTracker<'a> {
    client: &'a ServiceClient,
    /// Dotted path of the produced resource ID inside `entities`
    entity_path: &'static str,
}

impl<'a> ServiceJobTracker<'a> {
    pub fn new(client: &'a ServiceClient, entity_path: &'static str) -> Self {
        Self {
            client,
            entity_path,
        }
    }
}

#[async_trait]
impl JobTracker for ServiceJobTracker<'_> {
    type Job = ServiceJob;

    async fn fetch(&self, job_id: &str) -> Result<ServiceJob, RefreshError> {
        let body = self
            .client
            .get(&format!("v1/{{project_id}}/jobs/{}", job_id))
            .await?;
        serde_json::from_value(body).map_err(|e| {
            RefreshError::new(format!("Invalid job {} response: {}", job_id, e)).with_source(e)
        })
    }

    fn status(&self, job: &ServiceJob) -> JobStatus {
        match job.status.as_str() {
            "INIT" => JobStatus::Queued,
            "RUNNING" => JobStatus::Running,
            "SUCCESS" => JobStatus::Succeeded,
            "FAIL" => JobStatus::Failed,
            other => {
                log::debug!("Job {} reports status '{}'", job.job_id, other);
                JobStatus::Running
            }
        }
    }

    fn failure_reason(&self, job: &ServiceJob) -> Option<String> {
        match (&job.error_code, &job.fail_reason) {
            (Some(code), Some(reason)) => Some(format!("{}: {}", code, reason)),
            (None, Some(reason)) => Some(reason.clone()),
            (Some(code), None) => Some(code.clone()),
            (None, None) => None,
        }
    }

    async fn resource_id(&self, job: &ServiceJob) -> Result<Option<String>, RefreshError> {
        Ok(path_str(&job.entities, self.entity_path).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pace_scales_durations() {
        let ctx = WaitContext::new(CancellationToken::new()).with_scale(0.01);
        assert_eq!(ctx.pace(Duration::from_secs(10)), Duration::from_millis(100));
        assert_eq!(ctx.job_timing(Duration::from_secs(60)).timeout, Duration::from_secs(60));
    }

    #[test]
    fn pace_keeps_duration_when_scale_overflows() {
        let ctx = WaitContext::new(CancellationToken::new()).with_scale(f64::INFINITY);
        assert_eq!(ctx.pace(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn submitted_job_id_requires_non_empty_value() {
        assert_eq!(
            submitted_job_id(&json!({"job_id": "j-1"}), "job_id").unwrap(),
            "j-1"
        );
        assert!(submitted_job_id(&json!({"job_id": ""}), "job_id").is_err());
        assert!(submitted_job_id(&json!({"status": {"jobID": "j-2"}}), "job_id").is_err());
    }

    #[test]
    fn forbidden_submission_is_detected_through_provider_error() {
        let err: ProviderError = ApiError::Status {
            status: 403,
            body: "locked".to_string(),
        }
        .into();
        assert!(is_forbidden(&err));
        assert!(!is_forbidden(&ProviderError::new("other")));
    }

    #[test]
    fn service_job_failure_reason_joins_code() {
        let client = ServiceClient::new(reqwest::Client::new(), "http://unused/", "p", None);
        let tracker = ServiceJobTracker::new(&client, "volume_id");
        let job: ServiceJob = serde_json::from_value(json!({
            "job_id": "j",
            "status": "FAIL",
            "fail_reason": "capacity",
            "error_code": "EVS.2024"
        }))
        .unwrap();

        assert_eq!(tracker.status(&job), JobStatus::Failed);
        assert_eq!(tracker.failure_reason(&job).as_deref(), Some("EVS.2024: capacity"));
    }
}
