use async_trait::async_trait;

use crate::commit::{Commit, CommitsLoad};
use crate::errors::StoreError;

/// Entry point an event-store façade uses to reach the commit log.
pub trait Persistence: Send + Sync {
    /// Open a session. With `suppress_ambient_transaction` the session's
    /// operations never join a unit of work and always auto-commit.
    fn open_session(&self, suppress_ambient_transaction: bool) -> Box<dyn PersistenceSession>;
}

/// One unit of work against the commit log.
///
/// Sessions own their backing-store connections and are meant to be used
/// by a single logical caller at a time.
#[async_trait]
pub trait PersistenceSession: Send + Sync {
    /// All commits of a stream in ascending version order, or
    /// [`CommitsLoad::EMPTY`] when the stream has none.
    async fn load_commits(&self, stream_id: &str) -> Result<CommitsLoad, StoreError>;

    /// Append a commit. A duplicate `(stream_id, version)` yields
    /// [`StoreError::VersionConflict`].
    async fn save(&self, commit: &Commit) -> Result<bool, StoreError>;

    /// Remove every commit of a stream. Returns `true` only when exactly one
    /// row was removed.
    async fn delete(&self, stream_id: &str) -> Result<bool, StoreError>;

    /// Start a unit of work spanning the following operations.
    async fn begin(&self) -> Result<(), StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;

    async fn rollback(&self) -> Result<(), StoreError>;

    /// Close every connection the session holds. Closing twice is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
