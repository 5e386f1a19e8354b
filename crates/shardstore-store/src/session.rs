//! A persistence session over routed, lazily opened connections.
//!
//! The session caches one connection per `host:port` for its lifetime. Any
//! failure while obtaining a connection, bootstrapping storage or running a
//! command closes every cached connection before the error is returned, so
//! the next operation starts from fresh connections. An operation whose
//! future is dropped mid-flight leaves the session poisoned; the next
//! operation closes the cache first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use shardstore_core::{Commit, CommitsLoad, PersistenceSession, StoreError};
use shardstore_routing::{RoutingInfo, RoutingProvider};

use crate::backend::{Connector, DbConnection};
use crate::bootstrap::StorageBootstrap;
use crate::command::{Command, TableRef};
use crate::conflict::translate_save_error;
use crate::connection::ConnectionFactory;
use crate::row_helpers::row_to_commit;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitOfWork {
    Inactive,
    Active,
    /// A failure discarded the connections of an active unit of work.
    Aborted,
}

struct SessionConnection {
    conn: Box<dyn DbConnection>,
    /// `BEGIN` was issued for the current unit of work.
    in_transaction: bool,
}

/// Marks the session poisoned unless the operation ran to completion.
struct InFlight<'a> {
    poisoned: &'a AtomicBool,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(poisoned: &'a AtomicBool) -> Self {
        Self {
            poisoned,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }
}

pub struct ShardedSession {
    connector: Arc<dyn Connector>,
    factory: Arc<dyn ConnectionFactory>,
    router: Arc<dyn RoutingProvider>,
    bootstrap: Arc<StorageBootstrap>,
    schema: String,
    suppress_ambient_transaction: bool,
    connections: DashMap<String, Arc<Mutex<SessionConnection>>>,
    unit_of_work: parking_lot::Mutex<UnitOfWork>,
    closed: AtomicBool,
    poisoned: AtomicBool,
}

impl ShardedSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        factory: Arc<dyn ConnectionFactory>,
        router: Arc<dyn RoutingProvider>,
        bootstrap: Arc<StorageBootstrap>,
        schema: impl Into<String>,
        suppress_ambient_transaction: bool,
    ) -> Self {
        Self {
            connector,
            factory,
            router,
            bootstrap,
            schema: schema.into(),
            suppress_ambient_transaction,
            connections: DashMap::new(),
            unit_of_work: parking_lot::Mutex::new(UnitOfWork::Inactive),
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn suppresses_ambient_transaction(&self) -> bool {
        self.suppress_ambient_transaction
    }

    /// Number of cached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn unit_of_work(&self) -> UnitOfWork {
        *self.unit_of_work.lock()
    }

    async fn ensure_usable(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::SessionClosed);
        }
        if self.poisoned.swap(false, Ordering::SeqCst) {
            warn!("an earlier operation was cancelled, closing cached connections");
            self.close_all_connections().await;
        }
        Ok(())
    }

    fn ensure_not_aborted(&self) -> Result<(), StoreError> {
        if !self.suppress_ambient_transaction && self.unit_of_work() == UnitOfWork::Aborted {
            return Err(StoreError::UnitOfWork(
                "the unit of work was aborted by an earlier failure; roll it back first".into(),
            ));
        }
        Ok(())
    }

    fn route(&self, stream_id: &str) -> Result<(RoutingInfo, TableRef), StoreError> {
        if stream_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("stream id is empty".into()));
        }
        let routing = self.router.routing_info_for(stream_id)?;
        let table = TableRef::new(self.schema.as_str(), routing.partition());
        Ok((routing, table))
    }

    /// Cached connection for the host serving `routing`, bootstrapping its
    /// partition first.
    async fn connection_for(
        &self,
        routing: &RoutingInfo,
    ) -> Result<Arc<Mutex<SessionConnection>>, StoreError> {
        let params = self.factory.params_for(routing);
        let key = params.host_and_port();
        let cached = self.connections.get(&key).map(|e| Arc::clone(e.value()));

        self.bootstrap
            .ensure_ready(self.connector.as_ref(), &params, &self.schema, routing.partition())
            .await?;

        if let Some(cached) = cached {
            return Ok(cached);
        }

        let mut conn = self.connector.create(params);
        conn.open().await?;
        debug!(host = %key, "session connection opened");

        let (shared, surplus) = match self.connections.entry(key) {
            Entry::Occupied(e) => (Arc::clone(e.get()), Some(conn)),
            Entry::Vacant(v) => {
                let shared = Arc::new(Mutex::new(SessionConnection {
                    conn,
                    in_transaction: false,
                }));
                v.insert(Arc::clone(&shared));
                (shared, None)
            }
        };
        // a concurrent operation of this session cached one first
        if let Some(mut surplus) = surplus {
            close_connection(surplus.as_mut()).await;
        }
        Ok(shared)
    }

    async fn acquire(
        &self,
        routing: &RoutingInfo,
    ) -> Result<OwnedMutexGuard<SessionConnection>, StoreError> {
        let shared = self.connection_for(routing).await?;
        let mut conn = shared.lock_owned().await;
        self.enlist_if_needed(&mut conn).await?;
        Ok(conn)
    }

    /// Issue `BEGIN` on an enlisted connection joining an active unit of work.
    async fn enlist_if_needed(&self, conn: &mut SessionConnection) -> Result<(), StoreError> {
        if self.suppress_ambient_transaction || conn.in_transaction || !conn.conn.params().enlist {
            return Ok(());
        }
        match self.unit_of_work() {
            UnitOfWork::Inactive => Ok(()),
            UnitOfWork::Aborted => Err(StoreError::UnitOfWork(
                "the unit of work was aborted by an earlier failure".into(),
            )),
            UnitOfWork::Active => {
                conn.conn.execute(&Command::Begin).await?;
                conn.in_transaction = true;
                Ok(())
            }
        }
    }

    /// Close the connection cache when `result` is a failure.
    async fn settle<T>(&self, op: &'static str, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            if e.is_version_conflict() {
                debug!(op, error = %e, "closing session connections after version conflict");
            } else {
                warn!(op, error = %e, error_kind = e.error_kind(), "closing session connections after failure");
            }
            self.close_all_connections().await;
        }
        result
    }

    /// Close and forget every cached connection. An active unit of work is aborted.
    async fn close_all_connections(&self) {
        let keys: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<(String, Arc<Mutex<SessionConnection>>)> = keys
            .into_iter()
            .filter_map(|k| self.connections.remove(&k))
            .collect();

        for (host, shared) in drained {
            let mut conn = shared.lock().await;
            conn.in_transaction = false;
            if conn.conn.is_open() {
                if let Err(e) = conn.conn.close().await {
                    warn!(host = %host, error = %e, "failed to close session connection");
                }
            }
        }

        let mut uow = self.unit_of_work.lock();
        if *uow == UnitOfWork::Active {
            *uow = UnitOfWork::Aborted;
        }
    }

    fn cached(&self) -> Vec<(String, Arc<Mutex<SessionConnection>>)> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Send `COMMIT` or `ROLLBACK` to every connection that joined the unit of work.
    async fn end_unit_of_work(&self, command: Command) -> Result<(), StoreError> {
        for (host, shared) in self.cached() {
            let mut conn = shared.lock().await;
            if !conn.in_transaction {
                continue;
            }
            let result = conn.conn.execute(&command).await;
            conn.in_transaction = false;
            drop(conn);
            if let Err(e) = result {
                warn!(host = %host, command = command.name(), error = %e, "ending unit of work failed");
                self.close_all_connections().await;
                *self.unit_of_work.lock() = UnitOfWork::Inactive;
                return Err(e.into());
            }
        }
        *self.unit_of_work.lock() = UnitOfWork::Inactive;
        Ok(())
    }
}

async fn close_connection(conn: &mut dyn DbConnection) {
    if let Err(e) = conn.close().await {
        warn!(host = %conn.params().host_and_port(), error = %e, "failed to close connection");
    }
}

#[async_trait]
impl PersistenceSession for ShardedSession {
    #[instrument(skip(self))]
    async fn load_commits(&self, stream_id: &str) -> Result<CommitsLoad, StoreError> {
        self.ensure_usable().await?;
        self.ensure_not_aborted()?;
        let (routing, table) = self.route(stream_id)?;

        let guard = InFlight::start(&self.poisoned);
        let result: Result<CommitsLoad, StoreError> = async {
            let mut conn = self.acquire(&routing).await?;
            let rows = conn
                .conn
                .query(&Command::LoadStream {
                    table: table.clone(),
                    stream_id: stream_id.to_string(),
                })
                .await?;
            drop(conn);
            let name = table.name();
            let commits = rows
                .iter()
                .map(|row| row_to_commit(row, &name))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CommitsLoad::from_commits(commits))
        }
        .await;
        let result = self.settle("load", result).await;
        guard.finish();

        if let Ok(load) = &result {
            debug!(partition = routing.partition(), commits = load.len(), last_version = load.last_version, "commits loaded");
        }
        result
    }

    #[instrument(skip(self, commit), fields(stream_id = %commit.stream_id, version = commit.version))]
    async fn save(&self, commit: &Commit) -> Result<bool, StoreError> {
        self.ensure_usable().await?;
        self.ensure_not_aborted()?;
        commit.validate()?;
        let (routing, table) = self.route(&commit.stream_id)?;

        let guard = InFlight::start(&self.poisoned);
        let result: Result<bool, StoreError> = async {
            let mut conn = self.acquire(&routing).await?;
            let affected = conn
                .conn
                .execute(&Command::InsertCommit {
                    table,
                    commit: commit.clone(),
                })
                .await
                .map_err(translate_save_error)?;
            Ok(affected == 1)
        }
        .await;
        let result = self.settle("save", result).await;
        guard.finish();
        result
    }

    /// Removes every commit of the stream, but reports `true` only when
    /// exactly one row went away; a multi-commit stream yields `false`.
    #[instrument(skip(self))]
    async fn delete(&self, stream_id: &str) -> Result<bool, StoreError> {
        self.ensure_usable().await?;
        self.ensure_not_aborted()?;
        let (routing, table) = self.route(stream_id)?;

        let guard = InFlight::start(&self.poisoned);
        let result: Result<u64, StoreError> = async {
            let mut conn = self.acquire(&routing).await?;
            Ok(conn
                .conn
                .execute(&Command::DeleteStream {
                    table,
                    stream_id: stream_id.to_string(),
                })
                .await?)
        }
        .await;
        let result = self.settle("delete", result).await;
        guard.finish();

        let affected = result?;
        debug!(partition = routing.partition(), affected, "stream deleted");
        Ok(affected == 1)
    }

    async fn begin(&self) -> Result<(), StoreError> {
        self.ensure_usable().await?;
        let mut uow = self.unit_of_work.lock();
        match *uow {
            UnitOfWork::Inactive => {
                *uow = UnitOfWork::Active;
                Ok(())
            }
            UnitOfWork::Active => Err(StoreError::UnitOfWork("a unit of work is already active".into())),
            UnitOfWork::Aborted => Err(StoreError::UnitOfWork(
                "the unit of work was aborted by an earlier failure; roll it back first".into(),
            )),
        }
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.ensure_usable().await?;
        match self.unit_of_work() {
            UnitOfWork::Inactive => Err(StoreError::UnitOfWork("no active unit of work".into())),
            UnitOfWork::Aborted => {
                *self.unit_of_work.lock() = UnitOfWork::Inactive;
                Err(StoreError::UnitOfWork(
                    "the unit of work was aborted by an earlier failure and cannot be committed".into(),
                ))
            }
            UnitOfWork::Active => self.end_unit_of_work(Command::CommitTransaction).await,
        }
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.ensure_usable().await?;
        match self.unit_of_work() {
            UnitOfWork::Inactive => Err(StoreError::UnitOfWork("no active unit of work".into())),
            UnitOfWork::Aborted => {
                *self.unit_of_work.lock() = UnitOfWork::Inactive;
                Ok(())
            }
            UnitOfWork::Active => self.end_unit_of_work(Command::Rollback).await,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.connections.len();
        self.close_all_connections().await;
        *self.unit_of_work.lock() = UnitOfWork::Inactive;
        debug!(connections = count, "persistence session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ShardedSession {
    fn drop(&mut self) {
        if !self.is_closed() && !self.connections.is_empty() {
            debug!(connections = self.connections.len(), "persistence session dropped without close");
        }
    }
}
