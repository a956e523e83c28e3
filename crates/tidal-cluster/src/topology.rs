//! Topology mapping for rack-aware peer ordering

use std::collections::HashMap;

/// Resolves a host name to an opaque topology tag (rack, zone). The tag is
/// attached to a node's `BlockManagerId` at registration and only influences
/// peer ordering; equality between ids ignores it.
pub trait TopologyMapper: Send + Sync {
    fn topology_for_host(&self, host: &str) -> Option<String>;
}

/// Mapper for clusters without topology information
#[derive(Debug, Default)]
pub struct FlatTopologyMapper;

impl TopologyMapper for FlatTopologyMapper {
    fn topology_for_host(&self, _host: &str) -> Option<String> {
        None
    }
}

/// Mapper backed by a static host-to-rack table
#[derive(Debug, Default)]
pub struct StaticTopologyMapper {
    racks: HashMap<String, String>,
}

impl StaticTopologyMapper {
    #[must_use]
    pub fn new(racks: HashMap<String, String>) -> Self {
        Self { racks }
    }
}

impl TopologyMapper for StaticTopologyMapper {
    fn topology_for_host(&self, host: &str) -> Option<String> {
        self.racks.get(host).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_mapper_knows_nothing() {
        assert_eq!(FlatTopologyMapper.topology_for_host("host-a"), None);
    }

    #[test]
    fn static_mapper_resolves_known_hosts() {
        let mut racks = HashMap::new();
        racks.insert("host-a".to_string(), "/rack1".to_string());

        let mapper = StaticTopologyMapper::new(racks);
        assert_eq!(
            mapper.topology_for_host("host-a"),
            Some("/rack1".to_string())
        );
        assert_eq!(mapper.topology_for_host("host-b"), None);
    }
}
