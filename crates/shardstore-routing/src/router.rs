use std::collections::HashMap;

use tracing::debug;

use shardstore_core::StoreError;

use crate::hash::stream_hash;
use crate::partition_map::PartitionMap;
use crate::routing_info::RoutingInfo;

/// Maps a stream id to the host, port and partition holding its commits.
pub trait RoutingProvider: Send + Sync {
    fn routing_info_for(&self, stream_id: &str) -> Result<RoutingInfo, StoreError>;
}

/// Splits the 32-bit hash space into `partition_count` equal ranges.
#[derive(Clone, Debug)]
pub struct HashRangeRouter {
    partition_count: u32,
    step: u32,
    hosts: HashMap<u32, (String, u16)>,
}

impl HashRangeRouter {
    /// Validate the map and flatten it into a partition → host table.
    pub fn new(map: &PartitionMap) -> Result<Self, StoreError> {
        map.validate_or_err()?;
        let partition_count = u32::try_from(map.partition_count).map_err(|_| {
            StoreError::Configuration(format!("partition count {} is out of range", map.partition_count))
        })?;

        let mut hosts = HashMap::with_capacity(partition_count as usize);
        for host in &map.hosts {
            for p in host.partition_numbers() {
                hosts.insert(p, (host.host.clone(), host.port));
            }
        }

        debug!(partition_count, hosts = map.hosts.len(), "hash range router built");

        Ok(Self {
            partition_count,
            step: partition_step(partition_count),
            hosts,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn partition_for_hash(&self, hash: u32) -> u32 {
        partition_for_hash(hash, self.step, self.partition_count)
    }
}

impl RoutingProvider for HashRangeRouter {
    fn routing_info_for(&self, stream_id: &str) -> Result<RoutingInfo, StoreError> {
        let partition = self.partition_for_hash(stream_hash(stream_id));
        match self.hosts.get(&partition) {
            Some((host, port)) => Ok(RoutingInfo::new(host.clone(), *port, partition)),
            None => Err(StoreError::Routing {
                partition,
                stream_id: stream_id.to_string(),
            }),
        }
    }
}

/// Width of one partition's hash range.
pub fn partition_step(partition_count: u32) -> u32 {
    u32::MAX / partition_count.max(1)
}

/// 1-based partition owning `hash`.
///
/// `u32::MAX / count` rounds down, so the top of the hash space can land one
/// past the last partition; those hashes are clamped into the last partition.
/// Hashes below that tail keep the partition they always had.
pub fn partition_for_hash(hash: u32, step: u32, partition_count: u32) -> u32 {
    (hash / step + 1).min(partition_count)
}

/// Routing used when sharding is off: every stream goes to the single host.
#[derive(Clone, Copy, Debug, Default)]
pub struct VoidRouter;

impl RoutingProvider for VoidRouter {
    fn routing_info_for(&self, _stream_id: &str) -> Result<RoutingInfo, StoreError> {
        Ok(RoutingInfo::none())
    }
}
