//! In-memory stand-in for a set of PostgreSQL hosts.
//!
//! Each `host:port` holds schemas of commit tables. The simulation enforces
//! the same constraints the real tables do (primary key on `id`, unique
//! `(streamid, version)`), reports them with PostgreSQL's detail text, and
//! supports per-connection `BEGIN`/`COMMIT`/`ROLLBACK` through an undo log.
//! Writes of an open transaction are visible to other connections.
//!
//! Faults can be queued per command, hosts marked unreachable, and a latency
//! added to every command so cancellation can be exercised.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use shardstore_core::{Commit, CommitId, DbError};

use crate::backend::{Connector, DbConnection, DbRow, SqlValue};
use crate::command::{Command, TableRef};
use crate::connection::ConnectionParams;

#[derive(Debug, Default)]
struct SimSchema {
    owner: Option<String>,
    tables: BTreeMap<String, Vec<Commit>>,
}

#[derive(Debug)]
struct Fault {
    command: Option<&'static str>,
    error: DbError,
}

/// One command as seen by the simulated server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRecord {
    pub host: String,
    pub command: &'static str,
    /// The issuing connection joins units of work.
    pub enlisted: bool,
}

#[derive(Debug, Default)]
struct SimState {
    // host:port -> schema name -> schema
    hosts: HashMap<String, HashMap<String, SimSchema>>,
    unreachable: HashSet<String>,
    faults: VecDeque<Fault>,
    latency: Option<Duration>,
    ddl_runs: usize,
    opened: usize,
    closed: usize,
    log: Vec<CommandRecord>,
}

impl SimState {
    fn take_fault(&mut self, command: &'static str) -> Option<DbError> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.command.map_or(true, |c| c == command))?;
        self.faults.remove(idx).map(|f| f.error)
    }

    fn table_mut(&mut self, host: &str, table: &TableRef) -> Result<&mut Vec<Commit>, DbError> {
        self.hosts
            .get_mut(host)
            .and_then(|schemas| schemas.get_mut(&table.schema))
            .and_then(|schema| schema.tables.get_mut(&table.name()))
            .ok_or_else(|| missing_relation(table))
    }

    fn table(&self, host: &str, table: &TableRef) -> Result<&Vec<Commit>, DbError> {
        self.hosts
            .get(host)
            .and_then(|schemas| schemas.get(&table.schema))
            .and_then(|schema| schema.tables.get(&table.name()))
            .ok_or_else(|| missing_relation(table))
    }
}

fn missing_relation(table: &TableRef) -> DbError {
    DbError::Command(format!("relation \"{}\" does not exist", table.qualified()))
}

/// Shared handle on the simulated hosts; clones see the same state.
#[derive(Clone, Debug, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections to `host:port` fail to open until [`SimCluster::set_reachable`].
    pub fn set_unreachable(&self, host_and_port: &str) {
        self.state.lock().unreachable.insert(host_and_port.to_string());
    }

    pub fn set_reachable(&self, host_and_port: &str) {
        self.state.lock().unreachable.remove(host_and_port);
    }

    /// Fail the next command named `command` (any command when `None`) with `error`.
    pub fn fail_next(&self, command: Option<&'static str>, error: DbError) {
        self.state.lock().faults.push_back(Fault { command, error });
    }

    /// Delay applied before every command runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Number of storage-creation batches executed.
    pub fn ddl_runs(&self) -> usize {
        self.state.lock().ddl_runs
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn open_connections(&self) -> usize {
        let state = self.state.lock();
        state.opened - state.closed
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().log.clone()
    }

    /// Rows of one table, in insertion order.
    pub fn rows(&self, host_and_port: &str, schema: &str, partition: u32) -> Vec<Commit> {
        let state = self.state.lock();
        state
            .table(host_and_port, &TableRef::new(schema, partition))
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn has_table(&self, host_and_port: &str, schema: &str, partition: u32) -> bool {
        self.state
            .lock()
            .table(host_and_port, &TableRef::new(schema, partition))
            .is_ok()
    }

    pub fn schema_owner(&self, host_and_port: &str, schema: &str) -> Option<String> {
        self.state
            .lock()
            .hosts
            .get(host_and_port)
            .and_then(|schemas| schemas.get(schema))
            .and_then(|s| s.owner.clone())
    }
}

impl Connector for SimCluster {
    fn create(&self, params: ConnectionParams) -> Box<dyn DbConnection> {
        Box::new(SimConnection {
            host: params.host_and_port(),
            params,
            state: Arc::clone(&self.state),
            open: false,
            in_transaction: false,
            undo: Vec::new(),
        })
    }
}

#[derive(Debug)]
enum Undo {
    Inserted { table: TableRef, id: CommitId },
    Deleted { table: TableRef, rows: Vec<Commit> },
}

pub struct SimConnection {
    params: ConnectionParams,
    host: String,
    state: Arc<Mutex<SimState>>,
    open: bool,
    in_transaction: bool,
    undo: Vec<Undo>,
}

impl SimConnection {
    async fn run(&mut self, command: &Command) -> Result<(u64, Vec<DbRow>), DbError> {
        if !self.open {
            return Err(DbError::NotOpen);
        }
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.log.push(CommandRecord {
            host: self.host.clone(),
            command: command.name(),
            enlisted: self.params.enlist,
        });
        if let Some(error) = state.take_fault(command.name()) {
            return Err(error);
        }

        match command {
            Command::LoadStream { table, stream_id } => {
                let mut rows: Vec<&Commit> = state
                    .table(&self.host, table)?
                    .iter()
                    .filter(|c| &c.stream_id == stream_id)
                    .collect();
                rows.sort_by_key(|c| c.version);
                let rows: Vec<DbRow> = rows.into_iter().map(commit_to_row).collect();
                Ok((rows.len() as u64, rows))
            }
            Command::InsertCommit { table, commit } => {
                let rows = state.table_mut(&self.host, table)?;
                if rows.iter().any(|c| c.id == commit.id) {
                    return Err(DbError::UniqueViolation {
                        message: format!(
                            "duplicate key value violates unique constraint \"{}_pk\"",
                            table.name()
                        ),
                        detail: Some(format!("Key (id)=({}) already exists.", commit.id)),
                        table: Some(table.name()),
                    });
                }
                if rows
                    .iter()
                    .any(|c| c.stream_id == commit.stream_id && c.version == commit.version)
                {
                    return Err(DbError::UniqueViolation {
                        message: format!(
                            "duplicate key value violates unique constraint \"{}_streamid_version_uq\"",
                            table.name()
                        ),
                        detail: Some(format!(
                            "Key (streamid, version)=({}, {}) already exists.",
                            commit.stream_id, commit.version
                        )),
                        table: Some(table.name()),
                    });
                }
                rows.push(commit.clone());
                if self.in_transaction {
                    self.undo.push(Undo::Inserted {
                        table: table.clone(),
                        id: commit.id,
                    });
                }
                Ok((1, Vec::new()))
            }
            Command::DeleteStream { table, stream_id } => {
                let rows = state.table_mut(&self.host, table)?;
                let (removed, kept): (Vec<Commit>, Vec<Commit>) =
                    rows.drain(..).partition(|c| &c.stream_id == stream_id);
                *rows = kept;
                let affected = removed.len() as u64;
                if self.in_transaction && !removed.is_empty() {
                    self.undo.push(Undo::Deleted {
                        table: table.clone(),
                        rows: removed,
                    });
                }
                Ok((affected, Vec::new()))
            }
            Command::EnsureStorage {
                schema,
                owner,
                partitions,
                create_schema,
            } => {
                state.ddl_runs += 1;
                let schemas = state.hosts.entry(self.host.clone()).or_default();
                if !schemas.contains_key(schema) {
                    if !create_schema {
                        return Err(DbError::Command(format!(
                            "schema \"{schema}\" does not exist"
                        )));
                    }
                    schemas.insert(
                        schema.clone(),
                        SimSchema {
                            owner: owner.clone(),
                            tables: BTreeMap::new(),
                        },
                    );
                }
                if let Some(s) = schemas.get_mut(schema) {
                    for p in partitions {
                        s.tables
                            .entry(TableRef::new(schema.as_str(), *p).name())
                            .or_default();
                    }
                }
                Ok((0, Vec::new()))
            }
            Command::DropSchema { schema } => {
                if let Some(schemas) = state.hosts.get_mut(&self.host) {
                    schemas.remove(schema);
                }
                Ok((0, Vec::new()))
            }
            Command::StreamIds { table } => {
                let ids: std::collections::BTreeSet<&String> =
                    state.table(&self.host, table)?.iter().map(|c| &c.stream_id).collect();
                let rows: Vec<DbRow> = ids
                    .into_iter()
                    .map(|id| DbRow::new(vec![SqlValue::Text(Some(id.clone()))]))
                    .collect();
                Ok((rows.len() as u64, rows))
            }
            Command::Tables { schema, prefix } => {
                let rows: Vec<DbRow> = state
                    .hosts
                    .get(&self.host)
                    .and_then(|schemas| schemas.get(schema))
                    .map(|s| {
                        s.tables
                            .keys()
                            .filter(|name| name.starts_with(prefix.as_str()))
                            .map(|name| DbRow::new(vec![SqlValue::Text(Some(name.clone()))]))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((rows.len() as u64, rows))
            }
            Command::Begin => {
                if self.in_transaction {
                    return Err(DbError::Command(
                        "there is already a transaction in progress".into(),
                    ));
                }
                self.in_transaction = true;
                Ok((0, Vec::new()))
            }
            Command::CommitTransaction => {
                self.in_transaction = false;
                self.undo.clear();
                Ok((0, Vec::new()))
            }
            Command::Rollback => {
                rollback(&mut state, &self.host, &mut self.undo);
                self.in_transaction = false;
                Ok((0, Vec::new()))
            }
        }
    }
}

fn rollback(state: &mut SimState, host: &str, undo: &mut Vec<Undo>) {
    while let Some(step) = undo.pop() {
        match step {
            Undo::Inserted { table, id } => {
                if let Ok(rows) = state.table_mut(host, &table) {
                    rows.retain(|c| c.id != id);
                }
            }
            Undo::Deleted { table, rows } => {
                if let Ok(existing) = state.table_mut(host, &table) {
                    existing.extend(rows);
                }
            }
        }
    }
}

fn commit_to_row(c: &Commit) -> DbRow {
    DbRow::new(vec![
        SqlValue::Uuid(*c.id.as_uuid()),
        SqlValue::Text(Some(c.stream_id.clone())),
        SqlValue::SmallInt(c.items_count),
        SqlValue::Int(c.version),
        SqlValue::Text(Some(c.serializer_id.clone())),
        SqlValue::Bytes(Some(c.payload.clone())),
        SqlValue::Bytes(c.payload_layout.clone()),
    ])
}

#[async_trait]
impl DbConnection for SimConnection {
    fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&self.host) {
            return Err(DbError::Connection(format!(
                "could not connect to server {}",
                self.host
            )));
        }
        if !self.open {
            self.open = true;
            state.opened += 1;
        }
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, DbError> {
        self.run(command).await.map(|(affected, _)| affected)
    }

    async fn query(&mut self, command: &Command) -> Result<Vec<DbRow>, DbError> {
        self.run(command).await.map(|(_, rows)| rows)
    }

    async fn close(&mut self) -> Result<(), DbError> {
        if !self.open {
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.in_transaction {
            rollback(&mut state, &self.host, &mut self.undo);
            self.in_transaction = false;
        }
        self.open = false;
        state.closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{execute_once, query_once};

    fn params(host: &str) -> ConnectionParams {
        ConnectionParams::parse(&format!("Host={host};Port=5432;Username=postgres")).unwrap()
    }

    async fn provisioned(cluster: &SimCluster) -> Box<dyn DbConnection> {
        execute_once(cluster, params("db1"), &Command::ensure_partition("es", Some("postgres"), 1))
            .await
            .unwrap();
        let mut conn = cluster.create(params("db1"));
        conn.open().await.unwrap();
        conn
    }

    fn insert(commit: &Commit) -> Command {
        Command::InsertCommit {
            table: TableRef::new("es", 1),
            commit: commit.clone(),
        }
    }

    #[tokio::test]
    async fn enforces_stream_version_uniqueness() {
        let cluster = SimCluster::new();
        let mut conn = provisioned(&cluster).await;
        assert_eq!(conn.execute(&insert(&Commit::new("order-1", 1, 1, "json", "a"))).await.unwrap(), 1);

        let err = conn
            .execute(&insert(&Commit::new("order-1", 1, 1, "json", "b")))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DbError::UniqueViolation {
                message: "duplicate key value violates unique constraint \"commits_1_streamid_version_uq\"".into(),
                detail: Some("Key (streamid, version)=(order-1, 1) already exists.".into()),
                table: Some("commits_1".into()),
            }
        );
        assert_eq!(cluster.schema_owner("db1:5432", "es").as_deref(), Some("postgres"));
    }

    #[tokio::test]
    async fn missing_table_is_a_command_error() {
        let cluster = SimCluster::new();
        let rows = query_once(
            &cluster,
            params("db1"),
            &Command::LoadStream {
                table: TableRef::new("es", 2),
                stream_id: "s".into(),
            },
        )
        .await;
        assert_eq!(
            rows.unwrap_err(),
            DbError::Command("relation \"es.commits_2\" does not exist".into())
        );
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn rollback_undoes_writes() {
        let cluster = SimCluster::new();
        let mut conn = provisioned(&cluster).await;
        conn.execute(&insert(&Commit::new("keep", 1, 1, "json", "a"))).await.unwrap();

        conn.execute(&Command::Begin).await.unwrap();
        conn.execute(&insert(&Commit::new("tx", 1, 1, "json", "a"))).await.unwrap();
        conn.execute(&Command::DeleteStream {
            table: TableRef::new("es", 1),
            stream_id: "keep".into(),
        })
        .await
        .unwrap();
        conn.execute(&Command::Rollback).await.unwrap();

        let rows = cluster.rows("db1:5432", "es", 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stream_id, "keep");
    }

    #[tokio::test]
    async fn close_rolls_back_open_transaction() {
        let cluster = SimCluster::new();
        let mut conn = provisioned(&cluster).await;
        conn.execute(&Command::Begin).await.unwrap();
        conn.execute(&insert(&Commit::new("tx", 1, 1, "json", "a"))).await.unwrap();
        conn.close().await.unwrap();
        assert!(cluster.rows("db1:5432", "es", 1).is_empty());
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn faults_and_unreachable_hosts() {
        let cluster = SimCluster::new();
        let mut conn = provisioned(&cluster).await;
        cluster.fail_next(Some("delete_stream"), DbError::Connection("reset".into()));
        let load = Command::LoadStream {
            table: TableRef::new("es", 1),
            stream_id: "s".into(),
        };
        assert!(conn.query(&load).await.unwrap().is_empty());
        let delete = Command::DeleteStream {
            table: TableRef::new("es", 1),
            stream_id: "s".into(),
        };
        assert_eq!(conn.execute(&delete).await, Err(DbError::Connection("reset".into())));
        assert_eq!(conn.execute(&delete).await, Ok(0));

        cluster.set_unreachable("db2:5432");
        let mut other = cluster.create(params("db2"));
        assert!(matches!(other.open().await, Err(DbError::Connection(_))));
    }
}
