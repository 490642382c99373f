//! ECS - Elastic Cloud Servers

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hwcloud_core::job::JobHandle;
use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::refresh::{Observation, Refresh, RefreshError};
use hwcloud_core::wait::StateChangeConf;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{ServiceJobTracker, WaitContext, remaining, submitted_job_id};
use crate::client::ServiceClient;
use crate::utils::{path_search, path_str};

/// Power actions never wait longer than this for their job
const POWER_JOB_TIMEOUT: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Build,
    Active,
    Shutoff,
    Reboot,
    HardReboot,
    Resize,
    VerifyResize,
    Deleted,
    Error,
    Other(String),
}

impl ServerStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "BUILD" => Self::Build,
            "ACTIVE" => Self::Active,
            "SHUTOFF" => Self::Shutoff,
            "REBOOT" => Self::Reboot,
            "HARD_REBOOT" => Self::HardReboot,
            "RESIZE" => Self::Resize,
            "VERIFY_RESIZE" => Self::VerifyResize,
            "DELETED" => Self::Deleted,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Build => "BUILD",
            Self::Active => "ACTIVE",
            Self::Shutoff => "SHUTOFF",
            Self::Reboot => "REBOOT",
            Self::HardReboot => "HARD_REBOOT",
            Self::Resize => "RESIZE",
            Self::VerifyResize => "VERIFY_RESIZE",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn server_path(server_id: &str) -> String {
    format!("v1/{{project_id}}/cloudservers/{}", server_id)
}

/// Refresh function for one server
///
/// A 404 is reported as `DELETED` and `ERROR` aborts with the server's fault.
pub fn server_refresh<'a>(
    client: &'a ServiceClient,
    server_id: &'a str,
) -> impl Refresh<Value, ServerStatus> + 'a {
    move || async move {
        let body = match client.get(&server_path(server_id)).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                return Ok(Observation::found(Value::Null, ServerStatus::Deleted));
            }
            Err(e) => return Err(RefreshError::from(e)),
        };

        let server = body.get("server").cloned().unwrap_or(Value::Null);
        let status = ServerStatus::from_api(path_str(&server, "status").unwrap_or_default());

        if status == ServerStatus::Error {
            let code = path_search(&server, "fault.code")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            let message = path_str(&server, "fault.message").unwrap_or_default();
            return Err(RefreshError::new(format!(
                "error code: {}, message: {}",
                code, message
            ))
            .with_status(status));
        }

        Ok(Observation::found(server, status))
    }
}

/// Server details, or `None` once it is gone
pub async fn read_server(client: &ServiceClient, server_id: &str) -> ProviderResult<Option<Value>> {
    match client.get(&server_path(server_id)).await {
        Ok(body) => Ok(body.get("server").cloned()),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn wait_for_server_status(
    client: &ServiceClient,
    ctx: &WaitContext,
    server_id: &str,
    pending: Vec<ServerStatus>,
    target: Vec<ServerStatus>,
    timeout: Duration,
) -> ProviderResult<Value> {
    let description = target
        .iter()
        .map(ServerStatus::as_str)
        .collect::<Vec<_>>()
        .join("/");
    let conf = StateChangeConf::builder()
        .pending(pending)
        .target(target)
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(5)))
        .timeout(timeout)
        .build()?;

    let converged = ctx
        .wait(conf, server_refresh(client, server_id))
        .await
        .map_err(|e| {
            ProviderError::waiting(format!("instance ({}) to become {}", server_id, description), e)
        })?;
    Ok(converged.snapshot().unwrap_or(Value::Null))
}

/// Create a server and wait until it is ACTIVE
pub async fn create_server(
    client: &ServiceClient,
    ctx: &WaitContext,
    server: Value,
    timeout: Duration,
) -> ProviderResult<String> {
    let started = Instant::now();
    let body = client
        .post("v1.1/{project_id}/cloudservers", &json!({ "server": server }))
        .await?;
    let job_id = submitted_job_id(&body, "job_id")?;
    log::info!("Server creation submitted as job {}", job_id);

    let tracker = ServiceJobTracker::new(client, "sub_jobs[0].entities.server_id");
    let server_id = JobHandle::new(job_id)
        .wait_for_resource_id(&tracker, ctx.job_timing(timeout), &ctx.cancel)
        .await
        .map_err(|e| ProviderError::job("Error creating server", e))?;

    wait_for_server_status(
        client,
        ctx,
        &server_id,
        vec![ServerStatus::Build],
        vec![ServerStatus::Active],
        remaining(timeout, started),
    )
    .await?;
    Ok(server_id)
}

pub async fn rename_server(client: &ServiceClient, server_id: &str, name: &str) -> ProviderResult<()> {
    client
        .put(&server_path(server_id), &json!({ "server": { "name": name } }))
        .await?;
    Ok(())
}

/// Delete a server and wait until it is gone
pub async fn delete_server(
    client: &ServiceClient,
    ctx: &WaitContext,
    server_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    let request = json!({
        "servers": [{ "id": server_id }],
        "delete_publicip": false,
        "delete_volume": false
    });
    let body = match client.post("v1/{project_id}/cloudservers/delete", &request).await {
        Ok(body) => body,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let job_id = submitted_job_id(&body, "job_id")?;
    let tracker = ServiceJobTracker::new(client, "sub_jobs[0].entities.server_id");
    JobHandle::new(job_id)
        .wait_for_success(&tracker, ctx.job_timing(timeout), &ctx.cancel)
        .await
        .map_err(|e| ProviderError::job("Error deleting server", e))?;

    wait_for_server_status(
        client,
        ctx,
        server_id,
        vec![ServerStatus::Active, ServerStatus::Shutoff],
        vec![ServerStatus::Deleted],
        remaining(timeout, started),
    )
    .await?;
    Ok(())
}

/// Power state change requested for a server
///
/// `FORCE-` variants use a hard stop or reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Reboot,
    ForceOff,
    ForceReboot,
}

impl FromStr for PowerAction {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON" => Ok(Self::On),
            "OFF" => Ok(Self::Off),
            "REBOOT" => Ok(Self::Reboot),
            "FORCE-OFF" => Ok(Self::ForceOff),
            "FORCE-REBOOT" => Ok(Self::ForceReboot),
            other => Err(ProviderError::new(format!(
                "Invalid power action '{}', expected one of ON, OFF, REBOOT, FORCE-OFF, FORCE-REBOOT",
                other
            ))),
        }
    }
}

impl PowerAction {
    fn api_action(self) -> &'static str {
        match self {
            Self::On => "os-start",
            Self::Off | Self::ForceOff => "os-stop",
            Self::Reboot | Self::ForceReboot => "reboot",
        }
    }

    fn kind(self) -> Option<&'static str> {
        match self {
            Self::On => None,
            Self::ForceOff | Self::ForceReboot => Some("HARD"),
            Self::Off | Self::Reboot => Some("SOFT"),
        }
    }

    pub fn request_body(self, server_id: &str) -> Value {
        let mut action = json!({ "servers": [{ "id": server_id }] });
        if let Some(kind) = self.kind() {
            action["type"] = json!(kind);
        }
        let mut body = serde_json::Map::new();
        body.insert(self.api_action().to_string(), action);
        Value::Object(body)
    }

    pub fn expected_status(self) -> ServerStatus {
        match self {
            Self::Off | Self::ForceOff => ServerStatus::Shutoff,
            Self::On | Self::Reboot | Self::ForceReboot => ServerStatus::Active,
        }
    }

    fn pending_statuses(self) -> Vec<ServerStatus> {
        match self {
            Self::On => vec![ServerStatus::Shutoff],
            Self::Off | Self::ForceOff => vec![ServerStatus::Active],
            Self::Reboot | Self::ForceReboot => vec![ServerStatus::Reboot, ServerStatus::HardReboot],
        }
    }
}

/// Run a power action and wait until the server settles
pub async fn power_action(
    client: &ServiceClient,
    ctx: &WaitContext,
    server_id: &str,
    action: PowerAction,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    let body = client
        .post("v1/{project_id}/cloudservers/action", &action.request_body(server_id))
        .await?;
    let job_id = submitted_job_id(&body, "job_id")?;
    log::info!("Power action {:?} on {} submitted as job {}", action, server_id, job_id);

    let tracker = ServiceJobTracker::new(client, "sub_jobs[0].entities.server_id");
    JobHandle::new(job_id)
        .wait_for_success(&tracker, ctx.job_timing(timeout.min(POWER_JOB_TIMEOUT)), &ctx.cancel)
        .await
        .map_err(|e| ProviderError::job(format!("Error doing {:?} on server {}", action, server_id), e))?;

    wait_for_server_status(
        client,
        ctx,
        server_id,
        action.pending_statuses(),
        vec![action.expected_status()],
        remaining(timeout, started),
    )
    .await?;
    Ok(())
}
