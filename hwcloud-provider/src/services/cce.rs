//! CCE - Cloud Container Engine clusters, nodes and node pools
//!
//! Node creation is the most involved flow in the provider: the cluster must
//! be available before a node can be submitted, submissions are rejected
//! with 403 while another operation holds the cluster, and the node ID is
//! only known after following the job through its `CreateNode` sub-job to
//! the `CreateNodeVM` sub-job that carries the resource ID.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use hwcloud_core::job::{JobHandle, JobStatus, JobTracker};
use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::refresh::{Observation, Refresh, RefreshError};
use hwcloud_core::retry::retry_transient;
use hwcloud_core::wait::StateChangeConf;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{WaitContext, is_forbidden, remaining, submitted_job_id};
use crate::client::ServiceClient;
use crate::utils::path_str;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterStatus {
    Available,
    Creating,
    Upgrading,
    Unavailable,
    Other(String),
}

impl ClusterStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "Available" => Self::Available,
            "Creating" => Self::Creating,
            "Upgrading" => Self::Upgrading,
            "Unavailable" => Self::Unavailable,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Creating => write!(f, "Creating"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Unavailable => write!(f, "Unavailable"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Build,
    Installing,
    Active,
    Abnormal,
    Deleting,
    Error,
    Other(String),
}

impl NodeStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "Build" => Self::Build,
            "Installing" => Self::Installing,
            "Active" => Self::Active,
            "Abnormal" => Self::Abnormal,
            "Deleting" => Self::Deleting,
            "Error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "Build"),
            Self::Installing => write!(f, "Installing"),
            Self::Active => write!(f, "Active"),
            Self::Abnormal => write!(f, "Abnormal"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Error => write!(f, "Error"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Node pool phase; a ready pool reports an empty phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePoolPhase {
    Ready,
    Synchronizing,
    Synchronized,
    Deleting,
    Error,
    Other(String),
}

impl NodePoolPhase {
    pub fn from_api(s: &str) -> Self {
        match s {
            "" => Self::Ready,
            "Synchronizing" => Self::Synchronizing,
            "Synchronized" => Self::Synchronized,
            "Deleting" => Self::Deleting,
            "Error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodePoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, ""),
            Self::Synchronizing => write!(f, "Synchronizing"),
            Self::Synchronized => write!(f, "Synchronized"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Error => write!(f, "Error"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

fn cluster_path(cluster_id: &str) -> String {
    format!("api/v3/projects/{{project_id}}/clusters/{}", cluster_id)
}

fn node_path(cluster_id: &str, node_id: &str) -> String {
    format!("{}/nodes/{}", cluster_path(cluster_id), node_id)
}

fn node_pool_path(cluster_id: &str, pool_id: &str) -> String {
    format!("{}/nodepools/{}", cluster_path(cluster_id), pool_id)
}

/// GET `path` and classify `status.phase`; 404 means not found
async fn refresh_phase<S>(
    client: &ServiceClient,
    path: &str,
    classify: fn(&str) -> S,
) -> Result<Observation<Value, S>, RefreshError> {
    match client.get(path).await {
        Ok(body) => {
            let status = classify(path_str(&body, "status.phase").unwrap_or_default());
            Ok(Observation::found(body, status))
        }
        Err(e) if e.is_not_found() => Ok(Observation::NotFound),
        Err(e) => Err(RefreshError::from(e)),
    }
}

pub fn cluster_refresh<'a>(
    client: &'a ServiceClient,
    cluster_id: &'a str,
) -> impl Refresh<Value, ClusterStatus> + 'a {
    move || async move { refresh_phase(client, &cluster_path(cluster_id), ClusterStatus::from_api).await }
}

pub fn node_refresh<'a>(
    client: &'a ServiceClient,
    cluster_id: &'a str,
    node_id: &'a str,
) -> impl Refresh<Value, NodeStatus> + 'a {
    move || async move {
        refresh_phase(client, &node_path(cluster_id, node_id), NodeStatus::from_api).await
    }
}

pub fn node_pool_refresh<'a>(
    client: &'a ServiceClient,
    cluster_id: &'a str,
    pool_id: &'a str,
) -> impl Refresh<Value, NodePoolPhase> + 'a {
    move || async move {
        refresh_phase(client, &node_pool_path(cluster_id, pool_id), NodePoolPhase::from_api).await
    }
}

/// Wait until the cluster reports `Available`
///
/// Every other phase counts as pending.
pub async fn wait_for_cluster_available(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    let conf = StateChangeConf::builder()
        .pending_any()
        .target([ClusterStatus::Available])
        .not_found_checks(0)
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(5)))
        .timeout(timeout)
        .build()?;

    ctx.wait(conf, cluster_refresh(client, cluster_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("CCE cluster ({}) to become available", cluster_id), e))?;
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CceJob {
    pub metadata: CceJobMetadata,
    pub spec: CceJobSpec,
    pub status: CceJobState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CceJobMetadata {
    pub uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CceJobSpec {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    #[serde(rename = "subJobs")]
    pub sub_jobs: Vec<CceJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CceJobState {
    pub phase: String,
    pub reason: String,
}

/// Tracker for CCE jobs that resolves the resource through sub-jobs
pub struct CceJobTracker<'a> {
    client: &'a ServiceClient,
    /// Sub-job of the submitted job to follow (e.g. "CreateNode")
    job_type: &'static str,
    /// Sub-job of that job that carries the resource ID (e.g. "CreateNodeVM")
    sub_job_type: &'static str,
}

impl<'a> CceJobTracker<'a> {
    pub fn new(client: &'a ServiceClient, job_type: &'static str, sub_job_type: &'static str) -> Self {
        Self {
            client,
            job_type,
            sub_job_type,
        }
    }
}

#[async_trait]
impl JobTracker for CceJobTracker<'_> {
    type Job = CceJob;

    async fn fetch(&self, job_id: &str) -> Result<CceJob, RefreshError> {
        let body = self
            .client
            .get(&format!("api/v3/projects/{{project_id}}/jobs/{}", job_id))
            .await?;
        serde_json::from_value(body).map_err(|e| {
            RefreshError::new(format!("Invalid CCE job {} response: {}", job_id, e)).with_source(e)
        })
    }

    fn status(&self, job: &CceJob) -> JobStatus {
        match job.status.phase.as_str() {
            "Initializing" => JobStatus::Queued,
            "Running" => JobStatus::Running,
            "Success" => JobStatus::Succeeded,
            "Failed" => JobStatus::Failed,
            other => {
                log::debug!("CCE job {} reports phase '{}'", job.metadata.uid, other);
                JobStatus::Running
            }
        }
    }

    fn failure_reason(&self, job: &CceJob) -> Option<String> {
        Some(job.status.reason.clone()).filter(|r| !r.is_empty())
    }

    async fn resource_id(&self, job: &CceJob) -> Result<Option<String>, RefreshError> {
        let owner = match job.spec.sub_jobs.iter().find(|s| s.spec.job_type == self.job_type) {
            Some(sub) => self.fetch(&sub.metadata.uid).await?,
            None => job.clone(),
        };

        if owner.spec.sub_jobs.is_empty() {
            return Err(RefreshError::new(format!(
                "Error fetching sub jobs from job {}",
                owner.metadata.uid
            )));
        }

        Ok(owner
            .spec
            .sub_jobs
            .iter()
            .find(|s| s.spec.job_type == self.sub_job_type)
            .map(|s| s.spec.resource_id.clone()))
    }
}

/// Create a node in a cluster and wait until it is Active
///
/// Returns the node ID.
pub async fn create_node(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    node: Value,
    timeout: Duration,
) -> ProviderResult<String> {
    let started = Instant::now();
    wait_for_cluster_available(client, ctx, cluster_id, timeout).await?;

    let path = &format!("{}/nodes", cluster_path(cluster_id));
    let node = &node;
    let body = retry_transient(
        &ctx.retry_policy(remaining(timeout, started)),
        move || async move { client.post(path, node).await.map_err(ProviderError::from) },
        is_forbidden,
        move || async move {
            wait_for_cluster_available(client, ctx, cluster_id, remaining(timeout, started)).await
        },
    )
    .await?;

    let job_id = submitted_job_id(&body, "status.jobID")?;
    log::info!("CCE node creation in cluster {} submitted as job {}", cluster_id, job_id);

    let tracker = CceJobTracker::new(client, "CreateNode", "CreateNodeVM");
    let node_id = JobHandle::new(job_id)
        .wait_for_resource_id(&tracker, ctx.job_timing(remaining(timeout, started)), &ctx.cancel)
        .await
        .map_err(|e| ProviderError::job("Error creating CCE node", e))?;

    let conf = StateChangeConf::builder()
        .pending([NodeStatus::Build, NodeStatus::Installing])
        .target([NodeStatus::Active])
        .not_found_checks(0)
        .delay(ctx.pace(Duration::from_secs(10)))
        .poll_interval(ctx.pace(Duration::from_secs(10)))
        .timeout(remaining(timeout, started))
        .build()?;
    ctx.wait(conf, node_refresh(client, cluster_id, &node_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("CCE node ({}) to become Active", node_id), e))?;

    Ok(node_id)
}

pub async fn read_node(
    client: &ServiceClient,
    cluster_id: &str,
    node_id: &str,
) -> ProviderResult<Option<Value>> {
    match client.get(&node_path(cluster_id, node_id)).await {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_node(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    node_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    match client.delete(&node_path(cluster_id, node_id)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let conf = StateChangeConf::builder()
        .pending([NodeStatus::Active, NodeStatus::Abnormal, NodeStatus::Deleting])
        .target_not_found()
        .delay(ctx.pace(Duration::from_secs(60)))
        .poll_interval(ctx.pace(Duration::from_secs(10)))
        .timeout(timeout)
        .build()?;
    ctx.wait(conf, node_refresh(client, cluster_id, node_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("CCE node ({}) to delete", node_id), e))?;
    log::info!("CCE node {} deleted", node_id);
    Ok(())
}

async fn wait_for_node_pool_ready(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    pool_id: &str,
    timeout: Duration,
) -> ProviderResult<Value> {
    let conf = StateChangeConf::builder()
        .pending([NodePoolPhase::Synchronizing])
        .target([NodePoolPhase::Ready])
        .not_found_checks(0)
        .delay(ctx.pace(Duration::from_secs(60)))
        .poll_interval(ctx.pace(Duration::from_secs(10)))
        .timeout(timeout)
        .build()?;

    let converged = ctx
        .wait(conf, node_pool_refresh(client, cluster_id, pool_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("CCE node pool ({}) to become ready", pool_id), e))?;
    Ok(converged.snapshot().unwrap_or(Value::Null))
}

/// Create a node pool and wait until it is ready
pub async fn create_node_pool(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    pool: Value,
    timeout: Duration,
) -> ProviderResult<String> {
    let started = Instant::now();
    let body = client
        .post(&format!("{}/nodepools", cluster_path(cluster_id)), &pool)
        .await?;
    let pool_id = path_str(&body, "metadata.uid")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::new("Node pool creation returned no ID"))?
        .to_string();
    log::info!("CCE node pool {} created in cluster {}", pool_id, cluster_id);

    wait_for_node_pool_ready(client, ctx, cluster_id, &pool_id, remaining(timeout, started)).await?;
    Ok(pool_id)
}

pub async fn update_node_pool(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    pool_id: &str,
    pool: Value,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    client.put(&node_pool_path(cluster_id, pool_id), &pool).await?;
    wait_for_node_pool_ready(client, ctx, cluster_id, pool_id, remaining(timeout, started)).await?;
    Ok(())
}

pub async fn read_node_pool(
    client: &ServiceClient,
    cluster_id: &str,
    pool_id: &str,
) -> ProviderResult<Option<Value>> {
    match client.get(&node_pool_path(cluster_id, pool_id)).await {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_node_pool(
    client: &ServiceClient,
    ctx: &WaitContext,
    cluster_id: &str,
    pool_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    match client.delete(&node_pool_path(cluster_id, pool_id)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let conf = StateChangeConf::builder()
        .pending([
            NodePoolPhase::Deleting,
            NodePoolPhase::Ready,
            NodePoolPhase::Synchronizing,
        ])
        .target_not_found()
        .delay(ctx.pace(Duration::from_secs(60)))
        .poll_interval(ctx.pace(Duration::from_secs(10)))
        .timeout(timeout)
        .build()?;
    ctx.wait(conf, node_pool_refresh(client, cluster_id, pool_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("CCE node pool ({}) to delete", pool_id), e))?;
    Ok(())
}

/// Request body shared by nodes and node pools
pub fn manifest(kind: &str, name: &str, spec: Value) -> Value {
    json!({
        "kind": kind,
        "apiVersion": "v3",
        "metadata": { "name": name },
        "spec": spec
    })
}
