//! # shardstore
//!
//! Operator CLI for sharded commit storage: validate configuration, inspect
//! routing, provision or drop storage and list what is stored.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use shardstore_routing::{HostAndPort, RoutingInfo};
use shardstore_store::admin::{self, ProvisionReport};
use shardstore_store::config::{load_config_from_path, DEFAULT_SECTION};
use shardstore_store::connection::ConnectionFactory;
use shardstore_store::schema::validate_identifier;
use shardstore_store::{ConnectionParams, PgConnector, ShardedPersistence, StoreConfig};
use shardstore_telemetry::{init_telemetry, TelemetryConfig};

/// Sharded event store administration.
#[derive(Parser, Debug)]
#[command(name = "shardstore", about = "Sharded event store administration")]
struct Cli {
    /// JSON configuration file. Defaults apply when it does not exist.
    #[arg(long, default_value = "shardstore.json")]
    config: PathBuf,

    /// Colon-separated path of the store section inside the file.
    #[arg(long, default_value = DEFAULT_SECTION)]
    section: String,

    /// Default log level (RUST_LOG takes precedence).
    #[arg(long, default_value = "warn")]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check schema, connection string and partition map.
    Validate,
    /// Show where stream ids are stored.
    Route {
        #[arg(required = true)]
        stream_ids: Vec<String>,
    },
    /// Create the schema and commit tables on every configured host.
    Provision,
    /// Drop the configured schema on every configured host.
    DropSchema {
        /// Only this configured host, as `host[:port]`.
        #[arg(long)]
        host: Option<HostAndPort>,
    },
    /// List stream ids stored in one partition.
    Streams {
        #[arg(long)]
        partition: u32,
    },
    /// List commit tables on every configured host.
    Tables {
        #[arg(long)]
        prefix: Option<String>,
        /// Only this configured host, as `host[:port]`.
        #[arg(long)]
        host: Option<HostAndPort>,
    },
}

/// Connection parameters and partitions of every host the config names.
fn hosts(config: &StoreConfig, factory: &dyn ConnectionFactory) -> Vec<(ConnectionParams, Vec<u32>)> {
    if config.sharding {
        config
            .partition_map
            .hosts
            .iter()
            .map(|h| {
                let routing = RoutingInfo::new(h.host.as_str(), h.port, 0);
                (factory.params_for(&routing), h.partition_numbers())
            })
            .collect()
    } else {
        vec![(factory.params_for(&RoutingInfo::none()), vec![0])]
    }
}

/// Narrow `hosts` to the one named on the command line, if any.
fn select_host(
    hosts: Vec<(ConnectionParams, Vec<u32>)>,
    only: Option<&HostAndPort>,
) -> Result<Vec<(ConnectionParams, Vec<u32>)>> {
    let Some(only) = only else {
        return Ok(hosts);
    };
    let wanted = only.to_string();
    let selected: Vec<_> = hosts
        .into_iter()
        .filter(|(params, _)| params.host_and_port() == wanted)
        .collect();
    if selected.is_empty() {
        bail!("host {wanted} is not configured");
    }
    Ok(selected)
}

/// Every problem with the config, one message each.
fn violations(config: &StoreConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if let Err(e) = validate_identifier(&config.schema) {
        problems.push(e.to_string());
    }
    if let Err(e) = ConnectionParams::parse(&config.connection_string) {
        problems.push(e.to_string());
    }
    if config.sharding {
        if let Err(found) = config.partition_map.validate() {
            problems.extend(found.iter().map(ToString::to_string));
        }
    }
    problems
}

fn route_line(persistence: &ShardedPersistence, stream_id: &str) -> Result<String> {
    let routing = persistence
        .router()
        .routing_info_for(stream_id)
        .with_context(|| format!("routing {stream_id}"))?;
    let params = persistence.factory().params_for(&routing);
    Ok(format!(
        "{stream_id} -> {}/{}",
        params.host_and_port(),
        routing.partition()
    ))
}

fn print_report(report: &ProvisionReport) {
    let partitions: Vec<String> = report.partitions.iter().map(u32::to_string).collect();
    println!(
        "{} [{}] {:?}",
        report.host,
        partitions.join(", "),
        report.outcome
    );
}

async fn run(cli: Cli, config: StoreConfig) -> Result<()> {
    if let Cmd::Validate = cli.command {
        let problems = violations(&config);
        if problems.is_empty() {
            println!("configuration is valid");
            return Ok(());
        }
        for problem in &problems {
            println!("{problem}");
        }
        bail!("{} configuration problem(s)", problems.len());
    }

    let connector = PgConnector;
    let persistence = ShardedPersistence::from_config(&config, Arc::new(connector))
        .context("invalid configuration")?;
    let schema = persistence.schema();
    let factory = persistence.factory().as_ref();

    match cli.command {
        Cmd::Validate => {}
        Cmd::Route { stream_ids } => {
            for id in &stream_ids {
                println!("{}", route_line(&persistence, id)?);
            }
        }
        Cmd::Provision => {
            let bootstrap = persistence.bootstrap();
            if config.sharding {
                let reports =
                    admin::provision(&connector, factory, &config.partition_map, schema, bootstrap)
                        .await?;
                reports.iter().for_each(print_report);
            } else {
                let params = factory.params_for(&RoutingInfo::none());
                let report = admin::provision_single(&connector, &params, schema, bootstrap).await?;
                print_report(&report);
            }
        }
        Cmd::DropSchema { host } => {
            for (params, _) in select_host(hosts(&config, factory), host.as_ref())? {
                admin::drop_schema(&connector, &params, schema).await?;
                println!("{} dropped {schema}", params.host_and_port());
            }
        }
        Cmd::Streams { partition } => {
            let Some((params, _)) = hosts(&config, factory)
                .into_iter()
                .find(|(_, partitions)| partitions.contains(&partition))
            else {
                bail!("partition {partition} is not configured");
            };
            for id in admin::stream_ids(&connector, &params, schema, partition).await? {
                println!("{id}");
            }
        }
        Cmd::Tables { prefix, host } => {
            for (params, _) in select_host(hosts(&config, factory), host.as_ref())? {
                let host = params.host_and_port();
                for table in admin::tables(&connector, &params, schema, prefix.as_deref()).await? {
                    println!("{host} {schema}.{table}");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: Vec::new(),
        json: cli.json_logs,
    })?;

    let config = load_config_from_path(&cli.config, &cli.section)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::debug!(sharding = config.sharding, schema = %config.schema, "configuration loaded");

    run(cli, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardstore_routing::{PartitionHostMap, PartitionMap};

    fn sharded_config() -> StoreConfig {
        StoreConfig {
            connection_string: "Host=localhost;Database=es;Username=postgres".into(),
            sharding: true,
            partition_map: PartitionMap::new(
                3,
                vec![
                    PartitionHostMap::new("db1", 5432, vec![1, 2]),
                    PartitionHostMap::new("db2", 5433, vec![3]),
                ],
            ),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["shardstore", "validate"]);
        assert_eq!(cli.config, PathBuf::from("shardstore.json"));
        assert_eq!(cli.section, DEFAULT_SECTION);
        assert_eq!(cli.log_level, Level::WARN);
        assert!(!cli.json_logs);
        assert!(matches!(cli.command, Cmd::Validate));
    }

    #[test]
    fn cli_route_requires_ids() {
        assert!(Cli::try_parse_from(["shardstore", "route"]).is_err());
        let cli = Cli::parse_from(["shardstore", "route", "order-1", "stream/42"]);
        match cli.command {
            Cmd::Route { stream_ids } => assert_eq!(stream_ids, vec!["order-1", "stream/42"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_streams_and_tables() {
        let cli = Cli::parse_from(["shardstore", "--log-level", "debug", "streams", "--partition", "3"]);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(matches!(cli.command, Cmd::Streams { partition: 3 }));

        let cli = Cli::parse_from(["shardstore", "tables", "--prefix", "commits_1"]);
        assert!(matches!(cli.command, Cmd::Tables { prefix: Some(ref p), host: None } if p == "commits_1"));
    }

    #[test]
    fn cli_host_filter_parses_host_and_port() {
        let cli = Cli::parse_from(["shardstore", "drop-schema", "--host", "db2:5433"]);
        match cli.command {
            Cmd::DropSchema { host: Some(hp) } => {
                assert_eq!(hp.host(), "db2");
                assert_eq!(hp.port(), 5433);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["shardstore", "tables", "--host", "db1"]);
        assert!(matches!(cli.command, Cmd::Tables { host: Some(ref hp), .. } if hp.port() == 5432));

        assert!(Cli::try_parse_from(["shardstore", "tables", "--host", "db 1:5432"]).is_err());
        assert!(Cli::try_parse_from(["shardstore", "drop-schema", "--host", "db1:80"]).is_err());
    }

    #[test]
    fn host_filter_selects_one_configured_host() {
        let config = sharded_config();
        let persistence = ShardedPersistence::from_config(&config, Arc::new(PgConnector)).unwrap();
        let factory = persistence.factory().as_ref();

        assert_eq!(select_host(hosts(&config, factory), None).unwrap().len(), 2);

        let db2: HostAndPort = "db2:5433".parse().unwrap();
        let selected = select_host(hosts(&config, factory), Some(&db2)).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.host_and_port(), "db2:5433");
        assert_eq!(selected[0].1, vec![3]);

        let unknown: HostAndPort = "db2:5432".parse().unwrap();
        let err = select_host(hosts(&config, factory), Some(&unknown)).unwrap_err();
        assert!(err.to_string().contains("db2:5432 is not configured"));
    }

    #[test]
    fn routes_print_host_and_partition() {
        let persistence =
            ShardedPersistence::from_config(&sharded_config(), Arc::new(PgConnector)).unwrap();
        assert_eq!(route_line(&persistence, "order-1").unwrap(), "order-1 -> db1:5432/1");
        assert_eq!(
            route_line(&persistence, "customer.7f3a").unwrap(),
            "customer.7f3a -> db2:5433/3"
        );
    }

    #[test]
    fn unsharded_routes_to_partition_zero() {
        let persistence =
            ShardedPersistence::from_config(&StoreConfig::default(), Arc::new(PgConnector)).unwrap();
        assert_eq!(route_line(&persistence, "order-1").unwrap(), "order-1 -> localhost:5432/0");
    }

    #[test]
    fn hosts_follow_the_partition_map() {
        let config = sharded_config();
        let persistence = ShardedPersistence::from_config(&config, Arc::new(PgConnector)).unwrap();
        let hosts = hosts(&config, persistence.factory().as_ref());
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].0.host_and_port(), "db1:5432");
        assert_eq!(hosts[1].1, vec![3]);
    }

    #[test]
    fn violations_are_listed_one_by_one() {
        let mut config = sharded_config();
        assert!(violations(&config).is_empty());

        config.schema = "bad schema".into();
        config.partition_map.hosts[1].partitions = vec![2];
        let problems = violations(&config);
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("more than once")));
    }

    #[test]
    fn unsharded_config_ignores_the_map() {
        let config = StoreConfig {
            partition_map: PartitionMap::new(0, Vec::new()),
            ..StoreConfig::default()
        };
        assert!(violations(&config).is_empty());
    }
}
