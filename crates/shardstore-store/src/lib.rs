pub mod admin;
pub mod backend;
pub mod bootstrap;
pub mod command;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod persistence;
pub mod postgres;
pub mod row_helpers;
pub mod schema;
pub mod session;
pub mod sim;

pub use backend::{Connector, DbConnection, DbRow, SqlValue};
pub use bootstrap::{BootstrapOutcome, StorageBootstrap};
pub use command::{Command, TableRef};
pub use config::StoreConfig;
pub use connection::{ConnectionFactory, ConnectionParams, RoutedConnFactory, SingularConnFactory};
pub use persistence::ShardedPersistence;
pub use postgres::PgConnector;
pub use session::{ShardedSession, UnitOfWork};
pub use sim::SimCluster;
