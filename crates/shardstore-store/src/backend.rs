//! The seam between the session and a concrete backing store.
//!
//! A backend hands out unopened connections for a set of parameters and
//! executes [`Command`]s over them. Everything above this module is
//! driver-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use shardstore_core::DbError;

use crate::command::Command;
use crate::connection::ConnectionParams;

/// A bound parameter or a decoded column value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlValue {
    Uuid(Uuid),
    Text(Option<String>),
    SmallInt(i16),
    Int(i32),
    Bytes(Option<Bytes>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Text(None) | Self::Bytes(None))
    }
}

/// One result row, columns in select-list order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbRow {
    values: Vec<SqlValue>,
}

impl DbRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A connection to one backing-store host. Created unopened.
#[async_trait]
pub trait DbConnection: Send {
    fn params(&self) -> &ConnectionParams;

    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<(), DbError>;

    /// Run a command, returning the number of affected rows.
    async fn execute(&mut self, command: &Command) -> Result<u64, DbError>;

    /// Run a command that yields rows.
    async fn query(&mut self, command: &Command) -> Result<Vec<DbRow>, DbError>;

    async fn close(&mut self) -> Result<(), DbError>;
}

/// Produces connections for a backend.
pub trait Connector: Send + Sync {
    fn create(&self, params: ConnectionParams) -> Box<dyn DbConnection>;
}

/// Open a dedicated connection, run one command and close it again.
pub async fn execute_once(
    connector: &dyn Connector,
    params: ConnectionParams,
    command: &Command,
) -> Result<u64, DbError> {
    let mut conn = connector.create(params);
    let result = match conn.open().await {
        Ok(()) => conn.execute(command).await,
        Err(e) => Err(e),
    };
    release(conn.as_mut()).await;
    result
}

/// Like [`execute_once`], for commands that yield rows.
pub async fn query_once(
    connector: &dyn Connector,
    params: ConnectionParams,
    command: &Command,
) -> Result<Vec<DbRow>, DbError> {
    let mut conn = connector.create(params);
    let result = match conn.open().await {
        Ok(()) => conn.query(command).await,
        Err(e) => Err(e),
    };
    release(conn.as_mut()).await;
    result
}

async fn release(conn: &mut dyn DbConnection) {
    if conn.is_open() {
        if let Err(e) = conn.close().await {
            warn!(host = %conn.params().host_and_port(), error = %e, "failed to close connection");
        }
    }
}
