#![allow(dead_code)]

use std::sync::Arc;

use shardstore_core::Commit;
use shardstore_routing::{HashRangeRouter, PartitionHostMap, PartitionMap, VoidRouter};
use shardstore_store::{
    RoutedConnFactory, ShardedPersistence, SimCluster, SingularConnFactory, StorageBootstrap,
};

pub const TEMPLATE: &str = "Host=localhost;Port=5432;Database=es;Username=postgres;Password=pw";
pub const SINGLE_HOST: &str = "localhost:5432";
pub const DB1: &str = "db1:5432";
pub const DB2: &str = "db2:5433";

/// Three partitions: 1 and 2 on db1, 3 on db2.
///
/// Known routes: `order-1` -> 1, `stream/42` -> 2, `customer.7f3a` -> 3.
pub fn three_partition_map() -> PartitionMap {
    PartitionMap::new(
        3,
        vec![
            PartitionHostMap::new("db1", 5432, vec![1, 2]),
            PartitionHostMap::new("db2", 5433, vec![3]),
        ],
    )
}

/// Sharded persistence over the simulated cluster with its own bootstrap cache.
pub fn sharded(cluster: &SimCluster) -> ShardedPersistence {
    let router = HashRangeRouter::new(&three_partition_map()).expect("valid map");
    ShardedPersistence::new(
        Arc::new(cluster.clone()),
        Arc::new(RoutedConnFactory::new(TEMPLATE).expect("valid template")),
        Arc::new(router),
        "es",
    )
    .expect("valid schema")
    .with_bootstrap(Arc::new(StorageBootstrap::new()))
}

/// Unsharded persistence on `localhost:5432`.
pub fn single(cluster: &SimCluster) -> ShardedPersistence {
    ShardedPersistence::new(
        Arc::new(cluster.clone()),
        Arc::new(SingularConnFactory::new(TEMPLATE).expect("valid template")),
        Arc::new(VoidRouter),
        "es",
    )
    .expect("valid schema")
    .with_bootstrap(Arc::new(StorageBootstrap::new()))
}

pub fn commit(stream_id: &str, version: i32) -> Commit {
    Commit::new(stream_id, version, 1, "json", format!("{{\"v\":{version}}}").into_bytes())
}
