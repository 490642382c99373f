//! Huawei Cloud Provider implementation
//!
//! Dispatches resource CRUD to the service modules and reads the resulting
//! state back. Every wait started by this provider shares one cancellation
//! token, so [`HuaweiCloudProvider::shutdown`] aborts all of them.

use std::collections::HashMap;

use hwcloud_core::provider::{ProviderError, ProviderResult};
use hwcloud_core::resource::{Resource, ResourceId, State, Value};
use hwcloud_core::timeouts::Timeouts;
use tokio_util::sync::CancellationToken;

use crate::client::ServiceClient;
use crate::config::Config;
use crate::resources::resource_type;
use crate::services::ecs::{self, PowerAction};
use crate::services::{WaitContext, cce, evs, vpc};
use crate::utils::{attributes_to_json, json_to_attributes, value_to_json};

/// Huawei Cloud Provider
pub struct HuaweiCloudProvider {
    config: Config,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl HuaweiCloudProvider {
    pub fn new(config: Config) -> ProviderResult<Self> {
        config
            .validate()
            .map_err(|e| ProviderError::new(e.to_string()).with_cause(e))?;
        let http = ServiceClient::http_client(config.request_timeout, config.insecure)?;

        Ok(Self {
            config,
            http,
            cancel: CancellationToken::new(),
        })
    }

    /// Create a provider configured from `HW_*` environment variables
    pub fn from_env() -> ProviderResult<Self> {
        let config =
            Config::from_env().map_err(|e| ProviderError::new(e.to_string()).with_cause(e))?;
        Self::new(config)
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Abort every in-flight wait; they fail with a cancellation error
    pub fn shutdown(&self) {
        log::info!("Shutting down provider, cancelling in-flight waits");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn client(&self, service: &str) -> ServiceClient {
        ServiceClient::new(
            self.http.clone(),
            self.config.endpoint(service),
            self.config.project_id.clone(),
            self.config.auth_token.clone(),
        )
    }

    fn context(&self) -> WaitContext {
        WaitContext::new(self.cancel.clone())
            .with_scale(self.config.poll_scale)
            .with_max_retries(self.config.max_retries)
    }

    fn timeouts(&self, resource: &Resource) -> Timeouts {
        resource
            .timeouts
            .or_else(|| resource_type(&resource.id.resource_type).map(|t| t.default_timeouts()))
            .unwrap_or_default()
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Read a resource by its cloud-side identifier
    pub async fn read_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<State> {
        let found = match id.resource_type.as_str() {
            "ecs_instance" => ecs::read_server(&self.client("ecs"), identifier)
                .await?
                .map(|server| json_to_attributes(&server)),
            "evs_volume" => evs::read_volume(&self.client("evs"), identifier)
                .await?
                .map(|volume| json_to_attributes(&volume)),
            "vpc_subnet" => vpc::read_subnet(&self.client("vpc"), identifier)
                .await?
                .map(|subnet| json_to_attributes(&subnet)),
            "cce_node" => {
                let (cluster_id, node_id) = split_cce_identifier(identifier)?;
                cce::read_node(&self.client("cce"), cluster_id, node_id)
                    .await?
                    .map(|body| cce_attributes(&body, cluster_id))
            }
            "cce_node_pool" => {
                let (cluster_id, pool_id) = split_cce_identifier(identifier)?;
                cce::read_node_pool(&self.client("cce"), cluster_id, pool_id)
                    .await?
                    .map(|body| cce_attributes(&body, cluster_id))
            }
            other => return Err(unknown_type(other).for_resource(id.clone())),
        };

        Ok(match found {
            Some(attributes) => State::existing(id.clone(), attributes).with_identifier(identifier),
            None => State::not_found(id.clone()),
        })
    }

    /// Create a resource and wait until it is usable
    pub async fn create_resource(&self, resource: Resource) -> ProviderResult<State> {
        let identifier = self
            .create_inner(&resource)
            .await
            .map_err(|e| e.for_resource(resource.id.clone()))?;
        log::info!(
            "Created {}.{} as {}",
            resource.id.resource_type,
            resource.id.name,
            identifier
        );

        self.read_resource(&resource.id, &identifier).await
    }

    async fn create_inner(&self, resource: &Resource) -> ProviderResult<String> {
        let timeout = self.timeouts(resource).create;
        let ctx = self.context();
        let attributes = &resource.attributes;

        match resource.id.resource_type.as_str() {
            "ecs_instance" => {
                let client = self.client("ecs");
                let action = resource
                    .get_str("power_action")
                    .map(str::parse::<PowerAction>)
                    .transpose()?;
                let body = attributes_to_json(attributes, &["power_action"]);
                let server_id = ecs::create_server(&client, &ctx, body, timeout).await?;

                if let Some(action) = action.filter(|a| *a != PowerAction::On) {
                    ecs::power_action(&client, &ctx, &server_id, action, timeout).await?;
                }
                Ok(server_id)
            }
            "evs_volume" => {
                let body = attributes_to_json(attributes, &[]);
                evs::create_volume(&self.client("evs"), &ctx, body, timeout).await
            }
            "vpc_subnet" => {
                let body = attributes_to_json(attributes, &[]);
                vpc::create_subnet(&self.client("vpc"), &ctx, body, timeout).await
            }
            "cce_node" => {
                let cluster_id = required_str(resource, "cluster_id")?;
                let body = cce::manifest(
                    "Node",
                    &resource.id.name,
                    attributes_to_json(attributes, &["cluster_id"]),
                );
                let node_id =
                    cce::create_node(&self.client("cce"), &ctx, cluster_id, body, timeout).await?;
                Ok(format!("{}/{}", cluster_id, node_id))
            }
            "cce_node_pool" => {
                let cluster_id = required_str(resource, "cluster_id")?;
                let body = cce::manifest(
                    "NodePool",
                    &resource.id.name,
                    attributes_to_json(attributes, &["cluster_id"]),
                );
                let pool_id =
                    cce::create_node_pool(&self.client("cce"), &ctx, cluster_id, body, timeout)
                        .await?;
                Ok(format!("{}/{}", cluster_id, pool_id))
            }
            other => Err(unknown_type(other)),
        }
    }

    /// Update a resource in place
    pub async fn update_resource(
        &self,
        identifier: &str,
        from: &State,
        to: Resource,
    ) -> ProviderResult<State> {
        self.update_inner(identifier, from, &to)
            .await
            .map_err(|e| e.for_resource(to.id.clone()))?;

        self.read_resource(&to.id, identifier).await
    }

    async fn update_inner(&self, identifier: &str, from: &State, to: &Resource) -> ProviderResult<()> {
        let timeout = self.timeouts(to).update;
        let ctx = self.context();

        match to.id.resource_type.as_str() {
            "ecs_instance" => {
                let client = self.client("ecs");
                if let Some(name) = to.get_str("name")
                    && from.attributes.get("name").and_then(Value::as_str) != Some(name)
                {
                    ecs::rename_server(&client, identifier, name).await?;
                }
                if let Some(action) = to.get_str("power_action") {
                    let action: PowerAction = action.parse()?;
                    let current = from.attributes.get("status").and_then(Value::as_str);
                    if current != Some(action.expected_status().as_str()) {
                        ecs::power_action(&client, &ctx, identifier, action, timeout).await?;
                    }
                }
                Ok(())
            }
            "evs_volume" => {
                let desired = to.attributes.get("size").and_then(Value::as_int);
                let current = from.attributes.get("size").and_then(Value::as_int);
                match (desired, current) {
                    (Some(desired), Some(current)) if desired < current => Err(ProviderError::new(
                        format!("Volume size cannot shrink from {} to {} GB", current, desired),
                    )),
                    (Some(desired), current) if Some(desired) != current => {
                        evs::extend_volume(&self.client("evs"), &ctx, identifier, desired, timeout)
                            .await
                    }
                    _ => Ok(()),
                }
            }
            "vpc_subnet" => {
                let vpc_id = required_str(to, "vpc_id")?;
                let changes = changed_attributes(&from.attributes, &to.attributes, &["vpc_id"]);
                if changes.is_empty() {
                    return Ok(());
                }
                vpc::update_subnet(
                    &self.client("vpc"),
                    &ctx,
                    vpc_id,
                    identifier,
                    serde_json::Value::Object(changes),
                    timeout,
                )
                .await
            }
            "cce_node_pool" => {
                let (cluster_id, pool_id) = split_cce_identifier(identifier)?;
                let body = cce::manifest(
                    "NodePool",
                    &to.id.name,
                    attributes_to_json(&to.attributes, &["cluster_id"]),
                );
                cce::update_node_pool(&self.client("cce"), &ctx, cluster_id, pool_id, body, timeout)
                    .await
            }
            "cce_node" => Err(ProviderError::new(
                "Update not supported for cce_node, delete and recreate",
            )),
            other => Err(unknown_type(other)),
        }
    }

    /// Delete a resource and wait until it is gone
    pub async fn delete_resource(&self, resource: &Resource, identifier: &str) -> ProviderResult<()> {
        self.delete_inner(resource, identifier)
            .await
            .map_err(|e| e.for_resource(resource.id.clone()))
    }

    async fn delete_inner(&self, resource: &Resource, identifier: &str) -> ProviderResult<()> {
        let timeout = self.timeouts(resource).delete;
        let ctx = self.context();

        match resource.id.resource_type.as_str() {
            "ecs_instance" => ecs::delete_server(&self.client("ecs"), &ctx, identifier, timeout).await,
            "evs_volume" => evs::delete_volume(&self.client("evs"), &ctx, identifier, timeout).await,
            "vpc_subnet" => {
                let vpc_id = required_str(resource, "vpc_id")?;
                vpc::delete_subnet(&self.client("vpc"), &ctx, vpc_id, identifier, timeout).await
            }
            "cce_node" => {
                let (cluster_id, node_id) = split_cce_identifier(identifier)?;
                cce::delete_node(&self.client("cce"), &ctx, cluster_id, node_id, timeout).await
            }
            "cce_node_pool" => {
                let (cluster_id, pool_id) = split_cce_identifier(identifier)?;
                cce::delete_node_pool(&self.client("cce"), &ctx, cluster_id, pool_id, timeout).await
            }
            other => Err(unknown_type(other)),
        }
    }
}

fn unknown_type(resource_type: &str) -> ProviderError {
    ProviderError::new(format!("Unknown resource type: {}", resource_type))
}

fn required_str<'a>(resource: &'a Resource, key: &str) -> ProviderResult<&'a str> {
    resource.get_str(key).ok_or_else(|| {
        ProviderError::new(format!(
            "{} requires the '{}' attribute",
            resource.id.resource_type, key
        ))
    })
}

/// Split a `<cluster_id>/<id>` identifier of a CCE resource
fn split_cce_identifier(identifier: &str) -> ProviderResult<(&str, &str)> {
    match identifier.split_once('/') {
        Some((cluster_id, id)) if !cluster_id.is_empty() && !id.is_empty() => Ok((cluster_id, id)),
        _ => Err(ProviderError::new(format!(
            "Invalid CCE identifier '{}', expected <cluster_id>/<id>",
            identifier
        ))),
    }
}

/// Attributes of a CCE object: its spec, the owning cluster and its phase
fn cce_attributes(body: &serde_json::Value, cluster_id: &str) -> HashMap<String, Value> {
    let mut attributes = json_to_attributes(body.get("spec").unwrap_or(&serde_json::Value::Null));
    attributes.insert("cluster_id".to_string(), Value::String(cluster_id.to_string()));
    if let Some(name) = body.pointer("/metadata/name").and_then(serde_json::Value::as_str) {
        attributes.insert("name".to_string(), Value::String(name.to_string()));
    }
    if let Some(phase) = body.pointer("/status/phase").and_then(serde_json::Value::as_str) {
        attributes.insert("status".to_string(), Value::String(phase.to_string()));
    }
    attributes
}

/// Desired attributes that differ from the current ones, as JSON
fn changed_attributes(
    current: &HashMap<String, Value>,
    desired: &HashMap<String, Value>,
    skip: &[&str],
) -> serde_json::Map<String, serde_json::Value> {
    desired
        .iter()
        .filter(|(k, v)| !skip.contains(&k.as_str()) && current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HuaweiCloudProvider {
        let mut config = Config {
            region: "cn-north-4".to_string(),
            project_id: "p1".to_string(),
            poll_scale: 0.001,
            ..Config::default()
        };
        for service in ["ecs", "evs", "vpc", "cce"] {
            config.endpoints.insert(service.to_string(), server.uri());
        }
        HuaweiCloudProvider::new(config).unwrap()
    }

    #[test]
    fn cce_identifier_must_name_cluster() {
        assert_eq!(split_cce_identifier("c1/node-1").unwrap(), ("c1", "node-1"));
        assert!(split_cce_identifier("node-1").is_err());
        assert!(split_cce_identifier("/node-1").is_err());
    }

    #[test]
    fn changed_attributes_skips_unchanged_and_listed_keys() {
        let mut current = HashMap::new();
        current.insert("name".to_string(), Value::String("a".to_string()));
        current.insert("vpc_id".to_string(), Value::String("v1".to_string()));
        let mut desired = current.clone();
        desired.insert("name".to_string(), Value::String("b".to_string()));
        desired.insert("vpc_id".to_string(), Value::String("v2".to_string()));

        let changes = changed_attributes(&current, &desired, &["vpc_id"]);
        assert_eq!(serde_json::Value::Object(changes), json!({"name": "b"}));
    }

    #[test]
    fn resource_timeouts_fall_back_to_type_defaults() {
        let config = Config {
            region: "r".to_string(),
            project_id: "p".to_string(),
            ..Config::default()
        };
        let provider = HuaweiCloudProvider::new(config).unwrap();

        let ecs = Resource::new("ecs_instance", "web");
        assert_eq!(provider.timeouts(&ecs).create, Duration::from_secs(30 * 60));

        let custom = ecs.with_timeouts(Timeouts::uniform(Duration::from_secs(60)));
        assert_eq!(provider.timeouts(&custom).create, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn read_of_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/p1/cloudvolumes/vol-x"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let state = provider(&server)
            .read_resource(&ResourceId::new("evs_volume", "data"), "vol-x")
            .await
            .unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn create_subnet_returns_read_back_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/p1/subnets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnet": {"id": "sn-1"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subnet": {"id": "sn-1", "name": "app", "cidr": "10.0.1.0/24", "status": "ACTIVE"}
            })))
            .mount(&server)
            .await;

        let resource = Resource::new("vpc_subnet", "app")
            .with_attribute("name", Value::String("app".to_string()))
            .with_attribute("cidr", Value::String("10.0.1.0/24".to_string()))
            .with_attribute("vpc_id", Value::String("vpc-1".to_string()));

        let state = provider(&server).create_resource(resource).await.unwrap();
        assert!(state.exists);
        assert_eq!(state.identifier.as_deref(), Some("sn-1"));
        assert_eq!(
            state.attributes.get("cidr"),
            Some(&Value::String("10.0.1.0/24".to_string()))
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_waits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/p1/subnets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnet": {"id": "sn-2"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/p1/subnets/sn-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnet": {"status": "UNKNOWN"}})))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let resource = Resource::new("vpc_subnet", "stuck");

        let (result, _) = tokio::join!(provider.create_resource(resource), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            provider.shutdown();
        });

        let err = result.unwrap_err();
        assert!(provider.is_shut_down());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "[vpc_subnet.stuck] Error waiting for subnet (sn-2) to become ACTIVE: Wait cancelled"
        );
    }

    #[tokio::test]
    async fn unknown_resource_type_is_rejected() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .delete_resource(&Resource::new("obs_bucket", "logs"), "logs")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "[obs_bucket.logs] Unknown resource type: obs_bucket");
    }

    #[tokio::test]
    async fn cce_node_cannot_be_updated_in_place() {
        let server = MockServer::start().await;
        let to = Resource::new("cce_node", "worker");
        let from = State::existing(to.id.clone(), HashMap::new());

        let err = provider(&server)
            .update_resource("c1/n1", &from, to)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Update not supported for cce_node"));
    }
}
