use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::ids::CommitId;

/// Longest stream id the commit tables accept (`VARCHAR(100)`).
pub const MAX_STREAM_ID_LEN: usize = 100;
/// Longest serializer id the commit tables accept (`VARCHAR(20)`).
pub const MAX_SERIALIZER_ID_LEN: usize = 20;

/// One immutable, versioned append record of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub stream_id: String,
    /// Number of events folded into this commit.
    pub items_count: i16,
    /// Stream-relative sequence number, starting at 1.
    pub version: i32,
    /// Name of the codec that produced `payload`.
    pub serializer_id: String,
    pub payload: Bytes,
    /// Internal structure of `payload`, when the codec needs one.
    pub payload_layout: Option<Bytes>,
}

impl Commit {
    /// New commit with a fresh id and no payload layout.
    pub fn new(
        stream_id: impl Into<String>,
        version: i32,
        items_count: i16,
        serializer_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: CommitId::new(),
            stream_id: stream_id.into(),
            items_count,
            version,
            serializer_id: serializer_id.into(),
            payload: payload.into(),
            payload_layout: None,
        }
    }

    pub fn with_payload_layout(mut self, layout: impl Into<Bytes>) -> Self {
        self.payload_layout = Some(layout.into());
        self
    }

    pub fn has_payload_layout(&self) -> bool {
        self.payload_layout.is_some()
    }

    /// Check the commit's own invariants before it reaches the store.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.is_nil() {
            return Err(StoreError::InvalidCommit("id is nil".into()));
        }
        if self.stream_id.trim().is_empty() {
            return Err(StoreError::InvalidCommit("stream id is empty".into()));
        }
        if self.stream_id.chars().count() > MAX_STREAM_ID_LEN {
            return Err(StoreError::InvalidCommit(format!(
                "stream id is longer than {MAX_STREAM_ID_LEN} characters"
            )));
        }
        if self.items_count < 1 {
            return Err(StoreError::InvalidCommit(format!(
                "items count must be positive, got {}",
                self.items_count
            )));
        }
        if self.version < 1 {
            return Err(StoreError::InvalidCommit(format!(
                "version must be positive, got {}",
                self.version
            )));
        }
        if self.serializer_id.trim().is_empty() {
            return Err(StoreError::InvalidCommit("serializer id is empty".into()));
        }
        if self.serializer_id.chars().count() > MAX_SERIALIZER_ID_LEN {
            return Err(StoreError::InvalidCommit(format!(
                "serializer id is longer than {MAX_SERIALIZER_ID_LEN} characters"
            )));
        }
        if self.payload.is_empty() {
            return Err(StoreError::InvalidCommit("payload is empty".into()));
        }
        Ok(())
    }
}

/// Result of loading a stream: its commits ordered by version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitsLoad {
    pub commits: Vec<Commit>,
    /// Version of the last commit, 0 when the stream has none.
    pub last_version: i32,
}

impl CommitsLoad {
    /// The stream does not exist or holds no commits.
    pub const EMPTY: CommitsLoad = CommitsLoad {
        commits: Vec::new(),
        last_version: 0,
    };

    /// Sort by version and derive `last_version`. No commits yields [`CommitsLoad::EMPTY`].
    pub fn from_commits(mut commits: Vec<Commit>) -> Self {
        if commits.is_empty() {
            return Self::EMPTY;
        }
        commits.sort_by_key(|c| c.version);
        let last_version = commits.last().map(|c| c.version).unwrap_or(0);
        Self {
            commits,
            last_version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }
}

impl Default for CommitsLoad {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn commit(version: i32) -> Commit {
        Commit::new("order-1", version, 1, "json", &b"{}"[..])
    }

    #[test]
    fn valid_commit_passes() {
        assert!(commit(1).validate().is_ok());
    }

    #[test]
    fn nil_id_rejected() {
        let mut c = commit(1);
        c.id = CommitId::from_uuid(Uuid::nil());
        assert!(matches!(c.validate(), Err(StoreError::InvalidCommit(_))));
    }

    #[test]
    fn empty_stream_rejected() {
        let mut c = commit(1);
        c.stream_id = "  ".into();
        assert!(matches!(c.validate(), Err(StoreError::InvalidCommit(_))));
    }

    #[test]
    fn long_stream_rejected() {
        let mut c = commit(1);
        c.stream_id = "s".repeat(MAX_STREAM_ID_LEN + 1);
        assert!(c.validate().is_err());
        c.stream_id = "s".repeat(MAX_STREAM_ID_LEN);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn non_positive_counts_rejected() {
        let mut c = commit(1);
        c.items_count = 0;
        assert!(c.validate().is_err());

        let c = commit(0);
        assert!(c.validate().is_err());

        let c = commit(-3);
        assert!(c.validate().is_err());
    }

    #[test]
    fn serializer_rules() {
        let mut c = commit(1);
        c.serializer_id = String::new();
        assert!(c.validate().is_err());
        c.serializer_id = "x".repeat(MAX_SERIALIZER_ID_LEN + 1);
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_payload_rejected() {
        let mut c = commit(1);
        c.payload = Bytes::new();
        let err = c.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid commit: payload is empty");
    }

    #[test]
    fn payload_layout_builder() {
        let c = commit(1).with_payload_layout(vec![1u8, 2, 3]);
        assert!(c.has_payload_layout());
        assert_eq!(c.payload_layout.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn load_sorts_by_version() {
        let load = CommitsLoad::from_commits(vec![commit(3), commit(1), commit(2)]);
        let versions: Vec<i32> = load.commits.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(load.last_version, 3);
        assert_eq!(load.len(), 3);
    }

    #[test]
    fn empty_load() {
        let load = CommitsLoad::from_commits(Vec::new());
        assert_eq!(load, CommitsLoad::EMPTY);
        assert!(load.is_empty());
        assert_eq!(load.last_version, 0);
        assert_eq!(CommitsLoad::default(), CommitsLoad::EMPTY);
    }
}
