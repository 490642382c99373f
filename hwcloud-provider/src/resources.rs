//! Resource type definitions
//!
//! Each resource type carries the timeouts used when a resource does not
//! override them.

use std::time::Duration;

use hwcloud_core::provider::ResourceType;
use hwcloud_core::timeouts::Timeouts;

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

macro_rules! define_resource_type {
    ($name:ident, $type_name:expr, $create:expr, $delete:expr) => {
        pub struct $name;
        impl ResourceType for $name {
            fn name(&self) -> &'static str {
                $type_name
            }
            fn default_timeouts(&self) -> Timeouts {
                Timeouts::uniform($create).with_delete($delete)
            }
        }
    };
}

define_resource_type!(EcsInstanceType, "ecs_instance", minutes(30), minutes(30));
define_resource_type!(EvsVolumeType, "evs_volume", minutes(10), minutes(10));
define_resource_type!(VpcSubnetType, "vpc_subnet", minutes(10), minutes(10));
define_resource_type!(CceNodeType, "cce_node", minutes(20), minutes(20));
define_resource_type!(CceNodePoolType, "cce_node_pool", minutes(20), minutes(20));

/// Returns all resource types supported by this provider
pub fn resource_types() -> Vec<Box<dyn ResourceType>> {
    vec![
        Box::new(EcsInstanceType),
        Box::new(EvsVolumeType),
        Box::new(VpcSubnetType),
        Box::new(CceNodeType),
        Box::new(CceNodePoolType),
    ]
}

/// Lookup by resource type name
pub fn resource_type(name: &str) -> Option<Box<dyn ResourceType>> {
    resource_types().into_iter().find(|t| t.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwcloud_core::timeouts::Operation;

    #[test]
    fn test_resource_type_lookup() {
        let node = resource_type("cce_node").unwrap();
        let timeouts = node.default_timeouts();
        assert_eq!(timeouts.for_operation(Operation::Create), minutes(20));
        assert_eq!(timeouts.for_operation(Operation::Read), minutes(5));
        assert!(resource_type("ec2_vpc").is_none());
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = resource_types().iter().map(|t| t.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }
}
