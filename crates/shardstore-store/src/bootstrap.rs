//! Process-wide memo of commit tables known to exist.
//!
//! Before a session first touches a `(host, port, schema, partition)` it asks
//! [`StorageBootstrap::ensure_ready`], which creates the schema and table once
//! per process over a dedicated, non-enlisted connection.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use shardstore_core::{DbError, StoreError};

use crate::backend::{execute_once, Connector};
use crate::command::Command;
use crate::connection::ConnectionParams;

static GLOBAL: LazyLock<Arc<StorageBootstrap>> =
    LazyLock::new(|| Arc::new(StorageBootstrap::new()));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    /// Another creator won the race; the storage is there all the same.
    AlreadyExisted,
}

/// Treat "already exists" from the DDL batch as success.
pub fn classify_bootstrap(result: Result<u64, DbError>) -> Result<BootstrapOutcome, DbError> {
    match result {
        Ok(_) => Ok(BootstrapOutcome::Created),
        Err(DbError::AlreadyExists(_)) => Ok(BootstrapOutcome::AlreadyExisted),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default)]
pub struct StorageBootstrap {
    finished: RwLock<HashSet<String>>,
    init_lock: Mutex<()>,
}

impl StorageBootstrap {
    /// An isolated cache, for tests and embedders that manage their own lifetime.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache. Created on first use, never reset.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub fn storage_key(params: &ConnectionParams, schema: &str, partition: u32) -> String {
        format!("{}/{schema}/{partition}", params.host_and_port())
    }

    pub fn is_ready(&self, key: &str) -> bool {
        self.finished.read().contains(key)
    }

    /// Record storage created out of band, e.g. by provisioning.
    pub fn mark_ready(&self, key: impl Into<String>) {
        self.finished.write().insert(key.into());
    }

    pub fn ready_count(&self) -> usize {
        self.finished.read().len()
    }

    /// Make sure the table for `partition` exists on the host of `params`.
    ///
    /// Returns `true` when this call ran the DDL, `false` when the storage was
    /// already known. Initializations are serialized process-wide; a failed
    /// one leaves the key unrecorded so the next caller retries.
    #[instrument(skip(self, connector, params), fields(host = %params.host_and_port()))]
    pub async fn ensure_ready(
        &self,
        connector: &dyn Connector,
        params: &ConnectionParams,
        schema: &str,
        partition: u32,
    ) -> Result<bool, StoreError> {
        let key = Self::storage_key(params, schema, partition);
        if self.is_ready(&key) {
            return Ok(false);
        }

        let _guard = self.init_lock.lock().await;
        if self.is_ready(&key) {
            return Ok(false);
        }

        let command = Command::ensure_partition(schema, params.owner(), partition);
        let outcome = classify_bootstrap(execute_once(connector, params.without_enlist(), &command).await)?;

        self.mark_ready(key);
        debug!(?outcome, "storage initialization finished");
        Ok(true)
    }
}
