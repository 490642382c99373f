//! Huawei Cloud Provider
//!
//! ## Module Structure
//!
//! - `config` - Region, project, credentials and endpoint resolution
//! - `client` - REST client bound to one service endpoint
//! - `services` - Status vocabularies, refresh functions and CRUD waits per service
//! - `resources` - Resource type definitions
//! - `provider` - HuaweiCloudProvider implementation
//! - `utils` - JSON path lookups and value conversion

pub mod client;
pub mod config;
pub mod provider;
pub mod resources;
pub mod services;
pub mod utils;

// Re-export main types
pub use client::{ApiError, ServiceClient};
pub use config::{Config, ConfigError};
pub use provider::HuaweiCloudProvider;

use hwcloud_core::provider::{BoxFuture, Provider, ProviderResult, ResourceType};
use hwcloud_core::resource::{Resource, ResourceId, State};

use resources::resource_types;

// =============================================================================
// Provider Trait Implementation
// =============================================================================

impl Provider for HuaweiCloudProvider {
    fn name(&self) -> &'static str {
        "huaweicloud"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        resource_types()
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.read_resource(&id, &identifier).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_resource(resource).await })
    }

    fn update(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move { self.update_resource(&identifier, &from, to).await })
    }

    fn delete(&self, resource: &Resource, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let resource = resource.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.delete_resource(&resource, &identifier).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_lists_all_resource_types() {
        let config = Config {
            region: "cn-north-4".to_string(),
            project_id: "p1".to_string(),
            ..Config::default()
        };
        let provider: Box<dyn Provider> = Box::new(HuaweiCloudProvider::new(config).unwrap());

        assert_eq!(provider.name(), "huaweicloud");
        let names: Vec<_> = provider.resource_types().iter().map(|t| t.name()).collect();
        assert!(names.contains(&"cce_node_pool"));
        assert!(names.contains(&"ecs_instance"));
    }
}
