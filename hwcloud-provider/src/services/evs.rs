//! EVS - Elastic Volume Service

use std::fmt;
use std::time::Duration;

use hwcloud_core::job::JobHandle;
use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::refresh::{Observation, Refresh, RefreshError};
use hwcloud_core::wait::StateChangeConf;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{ServiceJobTracker, WaitContext, remaining, submitted_job_id};
use crate::client::ServiceClient;
use crate::utils::path_str;

/// Volume statuses that mean the volume is unusable
const ERROR_STATUSES: [&str; 5] = [
    "error",
    "error_restoring",
    "error_extending",
    "error_deleting",
    "error_rollbacking",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Attaching,
    Detaching,
    Extending,
    Downloading,
    Deleting,
    /// One of the `error*` statuses, kept verbatim
    Error(String),
    Other(String),
}

impl VolumeStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "attaching" => Self::Attaching,
            "detaching" => Self::Detaching,
            "extending" => Self::Extending,
            "downloading" => Self::Downloading,
            "deleting" => Self::Deleting,
            s if ERROR_STATUSES.contains(&s) => Self::Error(s.to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Attaching => "attaching",
            Self::Detaching => "detaching",
            Self::Extending => "extending",
            Self::Downloading => "downloading",
            Self::Deleting => "deleting",
            Self::Error(s) | Self::Other(s) => s,
        }
    }

    fn usable() -> Vec<Self> {
        vec![Self::Available, Self::InUse]
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn volume_path(volume_id: &str) -> String {
    format!("v2/{{project_id}}/cloudvolumes/{}", volume_id)
}

/// Refresh function for one volume; error statuses abort the wait
pub fn volume_refresh<'a>(
    client: &'a ServiceClient,
    volume_id: &'a str,
) -> impl Refresh<Value, VolumeStatus> + 'a {
    move || async move {
        let body = match client.get(&volume_path(volume_id)).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(Observation::NotFound),
            Err(e) => return Err(RefreshError::from(e)),
        };

        let volume = body.get("volume").cloned().unwrap_or(Value::Null);
        let status = VolumeStatus::from_api(path_str(&volume, "status").unwrap_or_default());
        if let VolumeStatus::Error(raw) = &status {
            return Err(RefreshError::new(format!(
                "Volume {} went into status '{}'",
                volume_id, raw
            ))
            .with_status(&status));
        }
        Ok(Observation::found(volume, status))
    }
}

pub async fn read_volume(client: &ServiceClient, volume_id: &str) -> ProviderResult<Option<Value>> {
    match client.get(&volume_path(volume_id)).await {
        Ok(body) => Ok(body.get("volume").cloned()),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Wait until the volume reports a usable status twice in a row
async fn wait_until_usable(
    client: &ServiceClient,
    ctx: &WaitContext,
    volume_id: &str,
    pending: Vec<VolumeStatus>,
    timeout: Duration,
) -> ProviderResult<Value> {
    let conf = StateChangeConf::builder()
        .pending(pending)
        .target(VolumeStatus::usable())
        .not_found_checks(0)
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(3)))
        .continuous_target_occurrence(2)
        .timeout(timeout)
        .build()?;

    let converged = ctx
        .wait(conf, volume_refresh(client, volume_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("volume ({}) to become ready", volume_id), e))?;
    Ok(converged.snapshot().unwrap_or(Value::Null))
}

/// Create a volume and wait until it is usable
pub async fn create_volume(
    client: &ServiceClient,
    ctx: &WaitContext,
    volume: Value,
    timeout: Duration,
) -> ProviderResult<String> {
    let started = Instant::now();
    let body = client
        .post("v2.1/{project_id}/cloudvolumes", &json!({ "volume": volume }))
        .await?;
    let job_id = submitted_job_id(&body, "job_id")?;
    log::info!("Volume creation submitted as job {}", job_id);

    let tracker = ServiceJobTracker::new(client, "volume_id");
    let mut job = JobHandle::new(job_id);
    let volume_id = match path_str(&body, "volume_ids[0]") {
        Some(id) => {
            job.wait_for_success(&tracker, ctx.job_timing(timeout), &ctx.cancel)
                .await
                .map_err(|e| ProviderError::job("Error creating volume", e))?;
            id.to_string()
        }
        None => job
            .wait_for_resource_id(&tracker, ctx.job_timing(timeout), &ctx.cancel)
            .await
            .map_err(|e| ProviderError::job("Error creating volume", e))?,
    };

    wait_until_usable(
        client,
        ctx,
        &volume_id,
        vec![VolumeStatus::Creating, VolumeStatus::Downloading],
        remaining(timeout, started),
    )
    .await?;
    Ok(volume_id)
}

/// Grow a volume to `new_size` GB
pub async fn extend_volume(
    client: &ServiceClient,
    ctx: &WaitContext,
    volume_id: &str,
    new_size: i64,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    let body = client
        .post(
            &format!("v2.1/{{project_id}}/cloudvolumes/{}/action", volume_id),
            &json!({ "os-extend": { "new_size": new_size } }),
        )
        .await?;

    // Pay-per-use volumes extend synchronously and return no job
    if let Ok(job_id) = submitted_job_id(&body, "job_id") {
        let tracker = ServiceJobTracker::new(client, "volume_id");
        JobHandle::new(job_id)
            .wait_for_success(&tracker, ctx.job_timing(timeout), &ctx.cancel)
            .await
            .map_err(|e| ProviderError::job(format!("Error extending volume {}", volume_id), e))?;
    }

    wait_until_usable(
        client,
        ctx,
        volume_id,
        vec![VolumeStatus::Extending],
        remaining(timeout, started),
    )
    .await?;
    Ok(())
}

/// Delete a volume and wait until it is gone
pub async fn delete_volume(
    client: &ServiceClient,
    ctx: &WaitContext,
    volume_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    match client.delete(&volume_path(volume_id)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let conf = StateChangeConf::builder()
        .pending([
            VolumeStatus::Deleting,
            VolumeStatus::Downloading,
            VolumeStatus::Available,
        ])
        .target_not_found()
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(3)))
        .timeout(timeout)
        .build()?;

    ctx.wait(conf, volume_refresh(client, volume_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("volume ({}) to delete", volume_id), e))?;
    log::info!("Volume {} deleted", volume_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ServiceClient {
        ServiceClient::new(reqwest::Client::new(), format!("{}/", server.uri()), "p1", None)
    }

    fn fast_context() -> WaitContext {
        WaitContext::new(CancellationToken::new()).with_scale(0.001)
    }

    fn volume(status: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"volume": {"id": "vol-1", "status": status}}))
    }

    #[test]
    fn status_vocabulary() {
        assert_eq!(VolumeStatus::from_api("in-use"), VolumeStatus::InUse);
        assert_eq!(
            VolumeStatus::from_api("error_extending"),
            VolumeStatus::Error("error_extending".to_string())
        );
        assert_eq!(VolumeStatus::from_api("reserved").to_string(), "reserved");
    }

    #[tokio::test]
    async fn create_requires_two_consecutive_usable_observations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.1/p1/cloudvolumes"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"job_id": "job-v", "volume_ids": ["vol-1"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/jobs/job-v"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SUCCESS"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(volume("creating"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(volume("available"))
            .expect(2)
            .mount(&server)
            .await;

        let id = create_volume(
            &client(&server),
            &fast_context(),
            json!({"size": 10, "volume_type": "SSD"}),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(id, "vol-1");
    }

    #[tokio::test]
    async fn error_status_aborts_the_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.1/p1/cloudvolumes/vol-1/action"))
            .and(body_json(json!({"os-extend": {"new_size": 20}})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(volume("error_extending"))
            .mount(&server)
            .await;

        let err = extend_volume(&client(&server), &fast_context(), "vol-1", 20, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert!(
            err.to_string().ends_with("Volume vol-1 went into status 'error_extending'"),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn delete_waits_for_absence() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(volume("deleting"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        delete_volume(&client(&server), &fast_context(), "vol-1", Duration::from_secs(30))
            .await
            .unwrap();
    }
}
