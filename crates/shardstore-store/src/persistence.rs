use std::sync::Arc;

use tracing::info;

use shardstore_core::{Persistence, PersistenceSession, StoreError};
use shardstore_routing::{HashRangeRouter, RoutingProvider, VoidRouter};

use crate::backend::Connector;
use crate::bootstrap::StorageBootstrap;
use crate::config::StoreConfig;
use crate::connection::{ConnectionFactory, RoutedConnFactory, SingularConnFactory};
use crate::schema::validate_identifier;
use crate::session::ShardedSession;

/// Opens [`ShardedSession`]s over one routing setup.
#[derive(Clone)]
pub struct ShardedPersistence {
    connector: Arc<dyn Connector>,
    factory: Arc<dyn ConnectionFactory>,
    router: Arc<dyn RoutingProvider>,
    bootstrap: Arc<StorageBootstrap>,
    schema: String,
}

impl ShardedPersistence {
    /// Uses the process-wide [`StorageBootstrap`].
    pub fn new(
        connector: Arc<dyn Connector>,
        factory: Arc<dyn ConnectionFactory>,
        router: Arc<dyn RoutingProvider>,
        schema: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let schema = schema.into();
        validate_identifier(&schema)?;
        Ok(Self {
            connector,
            factory,
            router,
            bootstrap: StorageBootstrap::global(),
            schema,
        })
    }

    pub fn with_bootstrap(mut self, bootstrap: Arc<StorageBootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Hash-range routing with a routed factory when sharding is on; a single
    /// host otherwise.
    pub fn from_config(config: &StoreConfig, connector: Arc<dyn Connector>) -> Result<Self, StoreError> {
        config.validate()?;
        let (factory, router): (Arc<dyn ConnectionFactory>, Arc<dyn RoutingProvider>) =
            if config.sharding {
                (
                    Arc::new(RoutedConnFactory::new(&config.connection_string)?),
                    Arc::new(HashRangeRouter::new(&config.partition_map)?),
                )
            } else {
                (
                    Arc::new(SingularConnFactory::new(&config.connection_string)?),
                    Arc::new(VoidRouter),
                )
            };
        info!(
            schema = %config.schema,
            sharding = config.sharding,
            partitions = if config.sharding { config.partition_map.partition_count } else { 0 },
            "persistence configured"
        );
        Self::new(connector, factory, router, config.schema.clone())
    }

    pub fn session(&self, suppress_ambient_transaction: bool) -> ShardedSession {
        ShardedSession::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.factory),
            Arc::clone(&self.router),
            Arc::clone(&self.bootstrap),
            self.schema.clone(),
            suppress_ambient_transaction,
        )
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn router(&self) -> &Arc<dyn RoutingProvider> {
        &self.router
    }

    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn bootstrap(&self) -> &Arc<StorageBootstrap> {
        &self.bootstrap
    }
}

impl Persistence for ShardedPersistence {
    fn open_session(&self, suppress_ambient_transaction: bool) -> Box<dyn PersistenceSession> {
        Box::new(self.session(suppress_ambient_transaction))
    }
}
