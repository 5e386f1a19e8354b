pub mod hash;
pub mod host_and_port;
pub mod partition_map;
pub mod router;
pub mod routing_info;

pub use host_and_port::HostAndPort;
pub use partition_map::{config_section, MapViolation, PartitionHostMap, PartitionMap};
pub use router::{HashRangeRouter, RoutingProvider, VoidRouter};
pub use routing_info::RoutingInfo;
