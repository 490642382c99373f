//! VPC - Subnets

use std::fmt;
use std::time::Duration;

use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::refresh::{Observation, Refresh, RefreshError};
use hwcloud_core::retry::{RetryPolicy, retry_transient};
use hwcloud_core::wait::StateChangeConf;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{WaitContext, remaining};
use crate::client::{ApiError, ServiceClient};
use crate::utils::path_str;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetStatus {
    Active,
    Unknown,
    Error,
    Other(String),
}

impl SubnetStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "ACTIVE" => Self::Active,
            "UNKNOWN" => Self::Unknown,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SubnetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Error => write!(f, "ERROR"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

fn subnet_path(subnet_id: &str) -> String {
    format!("v1/{{project_id}}/subnets/{}", subnet_id)
}

fn classify(body: &Value) -> Observation<Value, SubnetStatus> {
    let subnet = body.get("subnet").cloned().unwrap_or(Value::Null);
    let status = SubnetStatus::from_api(path_str(&subnet, "status").unwrap_or_default());
    Observation::found(subnet, status)
}

pub fn subnet_refresh<'a>(
    client: &'a ServiceClient,
    subnet_id: &'a str,
) -> impl Refresh<Value, SubnetStatus> + 'a {
    move || async move {
        match client.get(&subnet_path(subnet_id)).await {
            Ok(body) => Ok(classify(&body)),
            Err(e) if e.is_not_found() => Ok(Observation::NotFound),
            Err(e) => Err(RefreshError::from(e)),
        }
    }
}

/// Refresh used while a subnet is being deleted
///
/// The service answers 403 or 500 for a while after the delete call; those
/// count as "still there".
pub fn subnet_delete_refresh<'a>(
    client: &'a ServiceClient,
    subnet_id: &'a str,
) -> impl Refresh<Value, SubnetStatus> + 'a {
    move || async move {
        match client.get(&subnet_path(subnet_id)).await {
            Ok(body) => Ok(classify(&body)),
            Err(e) if e.is_not_found() => Ok(Observation::NotFound),
            Err(e) if e.is_forbidden() || e.status_code() == Some(500) => {
                log::debug!("Subnet {} not deleted yet: {}", subnet_id, e);
                Ok(Observation::found(Value::Null, SubnetStatus::Active))
            }
            Err(e) => Err(RefreshError::from(e)),
        }
    }
}

pub async fn read_subnet(client: &ServiceClient, subnet_id: &str) -> ProviderResult<Option<Value>> {
    match client.get(&subnet_path(subnet_id)).await {
        Ok(body) => Ok(body.get("subnet").cloned()),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn wait_for_active(
    client: &ServiceClient,
    ctx: &WaitContext,
    subnet_id: &str,
    timeout: Duration,
) -> ProviderResult<Value> {
    let conf = StateChangeConf::builder()
        .pending([SubnetStatus::Unknown])
        .target([SubnetStatus::Active])
        .not_found_checks(0)
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(3)))
        .timeout(timeout)
        .build()?;

    let converged = ctx
        .wait(conf, subnet_refresh(client, subnet_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("subnet ({}) to become ACTIVE", subnet_id), e))?;
    Ok(converged.snapshot().unwrap_or(Value::Null))
}

/// Create a subnet and wait until it is ACTIVE
pub async fn create_subnet(
    client: &ServiceClient,
    ctx: &WaitContext,
    subnet: Value,
    timeout: Duration,
) -> ProviderResult<String> {
    let started = Instant::now();
    let body = client
        .post("v1/{project_id}/subnets", &json!({ "subnet": subnet }))
        .await?;
    let subnet_id = path_str(&body, "subnet.id")
        .ok_or_else(|| ProviderError::new("Subnet creation returned no ID"))?
        .to_string();
    log::info!("Subnet {} created, waiting for it to become ACTIVE", subnet_id);

    wait_for_active(client, ctx, &subnet_id, remaining(timeout, started)).await?;
    Ok(subnet_id)
}

pub async fn update_subnet(
    client: &ServiceClient,
    ctx: &WaitContext,
    vpc_id: &str,
    subnet_id: &str,
    changes: Value,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    client
        .put(
            &format!("v1/{{project_id}}/vpcs/{}/subnets/{}", vpc_id, subnet_id),
            &json!({ "subnet": changes }),
        )
        .await?;
    wait_for_active(client, ctx, subnet_id, remaining(timeout, started)).await?;
    Ok(())
}

/// Delete a subnet and wait until it is gone
///
/// The delete call itself is retried while ports are still being released
/// (HTTP 409).
pub async fn delete_subnet(
    client: &ServiceClient,
    ctx: &WaitContext,
    vpc_id: &str,
    subnet_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    let started = Instant::now();
    let path = &format!("v1/{{project_id}}/vpcs/{}/subnets/{}", vpc_id, subnet_id);
    let policy = RetryPolicy::new(ctx.max_retries)
        .with_backoff(ctx.pace(Duration::from_secs(5)))
        .with_max_elapsed(timeout);

    let submitted = retry_transient(
        &policy,
        move || async move { client.delete(path).await },
        |e: &ApiError| e.status_code() == Some(409),
        || async { Ok(()) },
    )
    .await;
    if let Err(e) = submitted {
        let message = e.to_string();
        let e = e.into_inner();
        if e.is_not_found() {
            return Ok(());
        }
        return Err(ProviderError::new(message).with_cause(e));
    }

    let conf = StateChangeConf::builder()
        .pending([SubnetStatus::Active, SubnetStatus::Unknown])
        .target_not_found()
        .delay(ctx.pace(Duration::from_secs(5)))
        .poll_interval(ctx.pace(Duration::from_secs(3)))
        .timeout(remaining(timeout, started))
        .build()?;

    ctx.wait(conf, subnet_delete_refresh(client, subnet_id))
        .await
        .map_err(|e| ProviderError::waiting(format!("subnet ({}) to delete", subnet_id), e))?;
    log::info!("Subnet {} deleted", subnet_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ServiceClient {
        ServiceClient::new(reqwest::Client::new(), format!("{}/", server.uri()), "p1", None)
    }

    fn fast_context() -> WaitContext {
        WaitContext::new(CancellationToken::new()).with_scale(0.001)
    }

    #[tokio::test]
    async fn create_waits_for_active() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/p1/subnets"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"subnet": {"id": "sn-1", "status": "UNKNOWN"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"subnet": {"id": "sn-1", "status": "UNKNOWN"}})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"subnet": {"id": "sn-1", "status": "ACTIVE"}})),
            )
            .mount(&server)
            .await;

        let id = create_subnet(
            &client(&server),
            &fast_context(),
            json!({"name": "sn", "cidr": "192.168.0.0/24", "vpc_id": "vpc-1"}),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(id, "sn-1");
    }

    #[tokio::test]
    async fn subnet_missing_after_create_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/p1/subnets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnet": {"id": "sn-9"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-9"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = create_subnet(&client(&server), &fast_context(), json!({"name": "sn"}), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't find resource (1 retries)"));
    }

    #[tokio::test]
    async fn errored_subnet_is_unexpected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/p1/vpcs/vpc-1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnet": {"status": "ERROR"}})))
            .mount(&server)
            .await;

        let err = update_subnet(
            &client(&server),
            &fast_context(),
            "vpc-1",
            "sn-1",
            json!({"name": "renamed"}),
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unexpected state 'ERROR'"), "{}", err);
    }

    #[tokio::test]
    async fn delete_tolerates_transient_forbidden_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/p1/vpcs/vpc-1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/p1/vpcs/vpc-1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        delete_subnet(
            &client(&server),
            &fast_context(),
            "vpc-1",
            "sn-1",
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn delete_surfaces_other_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/p1/vpcs/vpc-1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = delete_subnet(
            &client(&server),
            &fast_context(),
            "vpc-1",
            "sn-1",
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().ends_with("HTTP 400: bad request"), "{}", err);
    }
}
