//! Provisioning and inspection of commit storage outside of sessions.

use futures::future::try_join_all;
use tracing::{debug, info, instrument};

use shardstore_core::StoreError;
use shardstore_routing::{PartitionMap, RoutingInfo};

use crate::backend::{execute_once, query_once, Connector};
use crate::bootstrap::{classify_bootstrap, BootstrapOutcome, StorageBootstrap};
use crate::command::{Command, TableRef};
use crate::connection::{ConnectionFactory, ConnectionParams};
use crate::row_helpers::get;
use crate::schema::{validate_identifier, TABLE_PREFIX};

/// What provisioning did on one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionReport {
    pub host: String,
    pub partitions: Vec<u32>,
    pub outcome: BootstrapOutcome,
}

/// Create the schema and every partition table on every host of `map`, in parallel.
///
/// Storage created here is recorded in `bootstrap`, so sessions sharing it
/// skip their own initialization.
#[instrument(skip_all, fields(schema = %schema, hosts = map.hosts.len()))]
pub async fn provision(
    connector: &dyn Connector,
    factory: &dyn ConnectionFactory,
    map: &PartitionMap,
    schema: &str,
    bootstrap: &StorageBootstrap,
) -> Result<Vec<ProvisionReport>, StoreError> {
    validate_identifier(schema)?;
    map.validate_or_err()?;

    let jobs = map.hosts.iter().map(|host| {
        let routing = RoutingInfo::new(host.host.as_str(), host.port, 0);
        let params = factory.params_for(&routing).without_enlist();
        let partitions = host.partition_numbers();
        async move {
            let command = Command::EnsureStorage {
                schema: schema.to_string(),
                owner: params.owner().map(str::to_string),
                partitions: partitions.clone(),
                create_schema: true,
            };
            let host = params.host_and_port();
            let outcome = classify_bootstrap(execute_once(connector, params.clone(), &command).await)?;
            match outcome {
                BootstrapOutcome::Created => {
                    for p in &partitions {
                        bootstrap.mark_ready(StorageBootstrap::storage_key(&params, schema, *p));
                    }
                }
                // the batch stopped at the first existing table, later ones may be missing
                BootstrapOutcome::AlreadyExisted => {
                    ensure_each(connector, &params, schema, &partitions, bootstrap).await?;
                }
            }
            info!(host = %host, partitions = partitions.len(), ?outcome, "host provisioned");
            Ok::<_, StoreError>(ProvisionReport {
                host,
                partitions,
                outcome,
            })
        }
    });
    try_join_all(jobs).await
}

/// One creation batch per partition, each marked ready only once it succeeds.
async fn ensure_each(
    connector: &dyn Connector,
    params: &ConnectionParams,
    schema: &str,
    partitions: &[u32],
    bootstrap: &StorageBootstrap,
) -> Result<(), StoreError> {
    for p in partitions {
        let command = Command::ensure_partition(schema, params.owner(), *p);
        let outcome = classify_bootstrap(execute_once(connector, params.clone(), &command).await)?;
        debug!(host = %params.host_and_port(), partition = *p, ?outcome, "partition ensured");
        bootstrap.mark_ready(StorageBootstrap::storage_key(params, schema, *p));
    }
    Ok(())
}

/// Create the schema and the unpartitioned table on a single host.
pub async fn provision_single(
    connector: &dyn Connector,
    params: &ConnectionParams,
    schema: &str,
    bootstrap: &StorageBootstrap,
) -> Result<ProvisionReport, StoreError> {
    validate_identifier(schema)?;
    let params = params.without_enlist();
    let command = Command::ensure_partition(schema, params.owner(), 0);
    let outcome = classify_bootstrap(execute_once(connector, params.clone(), &command).await)?;
    bootstrap.mark_ready(StorageBootstrap::storage_key(&params, schema, 0));
    Ok(ProvisionReport {
        host: params.host_and_port(),
        partitions: vec![0],
        outcome,
    })
}

/// Drop the schema and everything in it, if it exists.
///
/// Bootstrap caches still holding the schema's keys must not be reused
/// against this host afterwards.
pub async fn drop_schema(
    connector: &dyn Connector,
    params: &ConnectionParams,
    schema: &str,
) -> Result<(), StoreError> {
    validate_identifier(schema)?;
    let command = Command::DropSchema {
        schema: schema.to_string(),
    };
    execute_once(connector, params.without_enlist(), &command).await?;
    info!(host = %params.host_and_port(), schema, "schema dropped");
    Ok(())
}

/// Distinct stream ids stored in one partition table.
pub async fn stream_ids(
    connector: &dyn Connector,
    params: &ConnectionParams,
    schema: &str,
    partition: u32,
) -> Result<Vec<String>, StoreError> {
    validate_identifier(schema)?;
    let table = TableRef::new(schema, partition);
    let rows = query_once(
        connector,
        params.without_enlist(),
        &Command::StreamIds {
            table: table.clone(),
        },
    )
    .await?;
    let name = table.name();
    rows.iter()
        .map(|row| get(row, 0, &name, "streamid"))
        .collect()
}

/// Base tables of `schema` whose names start with `prefix` (default `commits`).
pub async fn tables(
    connector: &dyn Connector,
    params: &ConnectionParams,
    schema: &str,
    prefix: Option<&str>,
) -> Result<Vec<String>, StoreError> {
    validate_identifier(schema)?;
    let command = Command::Tables {
        schema: schema.to_string(),
        prefix: prefix.unwrap_or(TABLE_PREFIX).to_string(),
    };
    let rows = query_once(connector, params.without_enlist(), &command).await?;
    rows.iter()
        .map(|row| get(row, 0, "information_schema.tables", "table_name"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RoutedConnFactory;
    use crate::sim::SimCluster;
    use shardstore_core::DbError;
    use shardstore_routing::PartitionHostMap;

    fn map() -> PartitionMap {
        PartitionMap::new(
            3,
            vec![
                PartitionHostMap::new("db1", 5432, vec![1, 2]),
                PartitionHostMap::new("db2", 5432, vec![3]),
            ],
        )
    }

    fn factory() -> RoutedConnFactory {
        RoutedConnFactory::new("Host=localhost;Username=postgres").unwrap()
    }

    #[tokio::test]
    async fn provisions_every_host() {
        let cluster = SimCluster::new();
        let bootstrap = StorageBootstrap::new();
        let mut reports = provision(&cluster, &factory(), &map(), "es", &bootstrap).await.unwrap();
        reports.sort_by(|a, b| a.host.cmp(&b.host));

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].host, "db1:5432");
        assert_eq!(reports[0].partitions, vec![1, 2]);
        assert_eq!(reports[1].outcome, BootstrapOutcome::Created);
        assert!(cluster.has_table("db1:5432", "es", 1));
        assert!(cluster.has_table("db1:5432", "es", 2));
        assert!(cluster.has_table("db2:5432", "es", 3));
        assert!(!cluster.has_table("db2:5432", "es", 1));
        assert_eq!(bootstrap.ready_count(), 3);
        assert!(bootstrap.is_ready("db2:5432/es/3"));
        assert_eq!(cluster.ddl_runs(), 2);
        assert!(cluster.commands().iter().all(|c| !c.enlisted));
    }

    #[tokio::test]
    async fn provisioning_tolerates_existing_storage() {
        let cluster = SimCluster::new();
        cluster.fail_next(
            Some("ensure_storage"),
            DbError::AlreadyExists("relation \"commits_1\" already exists".into()),
        );
        let params = factory().template().clone();
        let report = provision_single(&cluster, &params, "es", &StorageBootstrap::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, BootstrapOutcome::AlreadyExisted);
    }

    #[tokio::test]
    async fn existing_table_in_a_batch_still_creates_the_rest() {
        let cluster = SimCluster::new();
        let bootstrap = StorageBootstrap::new();
        cluster.fail_next(
            Some("ensure_storage"),
            DbError::AlreadyExists("relation \"commits_1\" already exists".into()),
        );
        let reports = provision(&cluster, &factory(), &map(), "es", &bootstrap).await.unwrap();

        assert_eq!(
            reports
                .iter()
                .filter(|r| r.outcome == BootstrapOutcome::AlreadyExisted)
                .count(),
            1
        );
        assert!(cluster.has_table("db1:5432", "es", 1));
        assert!(cluster.has_table("db1:5432", "es", 2));
        assert!(cluster.has_table("db2:5432", "es", 3));
        assert_eq!(bootstrap.ready_count(), 3);
    }

    #[tokio::test]
    async fn failed_partition_is_not_marked_ready() {
        let cluster = SimCluster::new();
        let bootstrap = StorageBootstrap::new();
        cluster.fail_next(
            Some("ensure_storage"),
            DbError::AlreadyExists("relation \"commits_1\" already exists".into()),
        );
        cluster.fail_next(
            Some("ensure_storage"),
            DbError::Connection("reset".into()),
        );
        let single = PartitionMap::new(2, vec![PartitionHostMap::new("db1", 5432, vec![1, 2])]);
        let err = provision(&cluster, &factory(), &single, "es", &bootstrap)
            .await
            .unwrap_err();

        assert!(err.is_retryable(), "{err:?}");
        assert!(!cluster.has_table("db1:5432", "es", 2));
        assert!(!bootstrap.is_ready("db1:5432/es/1"));
        assert!(!bootstrap.is_ready("db1:5432/es/2"));
    }

    #[tokio::test]
    async fn rejects_invalid_map() {
        let cluster = SimCluster::new();
        let bad = PartitionMap::new(3, vec![PartitionHostMap::new("db1", 5432, vec![1, 2])]);
        let err = provision(&cluster, &factory(), &bad, "es", &StorageBootstrap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert_eq!(cluster.ddl_runs(), 0);
    }

    #[tokio::test]
    async fn lists_tables_and_drops_schema() {
        let cluster = SimCluster::new();
        provision(&cluster, &factory(), &map(), "es", &StorageBootstrap::new())
            .await
            .unwrap();
        let db1 = factory().params_for(&RoutingInfo::new("db1", 5432, 1));

        assert_eq!(
            tables(&cluster, &db1, "es", None).await.unwrap(),
            vec!["commits_1".to_string(), "commits_2".to_string()]
        );
        assert!(tables(&cluster, &db1, "es", Some("events")).await.unwrap().is_empty());

        drop_schema(&cluster, &db1, "es").await.unwrap();
        assert!(tables(&cluster, &db1, "es", None).await.unwrap().is_empty());
        assert!(cluster.has_table("db2:5432", "es", 3));
    }
}
