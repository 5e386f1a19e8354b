/// Failures reported by a backing-store connection.
///
/// Backends normalise their driver errors into these variants so the
/// session can tell a duplicate key from an idempotent-DDL race from
/// everything else without knowing the driver.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// Unique constraint violation. `detail` is the store's diagnostic detail
    /// text (e.g. `Key (streamid, version)=(order-1, 1) already exists.`),
    /// `table` the physical table the constraint belongs to.
    #[error("unique constraint violated: {message}")]
    UniqueViolation {
        message: String,
        detail: Option<String>,
        table: Option<String>,
    },

    /// DDL raced with another creator of the same schema or table.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("cannot decode column {column}: {detail}")]
    Decode { column: usize, detail: String },
}

impl DbError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Domain error taxonomy of the commit store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    // Fatal: configuration or caller bugs
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no host is configured for partition {partition} derived from stream {stream_id}")]
    Routing { partition: u32, stream_id: String },
    #[error("persistence session is closed")]
    SessionClosed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("invalid unit of work: {0}")]
    UnitOfWork(String),

    // Expected: concurrent writers on the same stream
    #[error("version conflict on stream {}: version {version} already exists", .stream_id.as_deref().unwrap_or("<unknown>"))]
    VersionConflict {
        stream_id: Option<String>,
        version: i32,
        detail: Option<String>,
    },

    // Backing store
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: String,
        column: &'static str,
        detail: String,
    },
    #[error("backend error: {0}")]
    Backend(#[from] DbError),
}

impl StoreError {
    /// Conditions worth retrying with a fresh session (after a reload, for conflicts).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. } => true,
            Self::Backend(e) => matches!(e, DbError::Connection(_) | DbError::Command(_) | DbError::NotOpen),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Routing { .. }
                | Self::SessionClosed
                | Self::InvalidArgument(_)
                | Self::InvalidCommit(_)
                | Self::UnitOfWork(_)
        )
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Routing { .. } => "routing",
            Self::SessionClosed => "session_closed",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidCommit(_) => "invalid_commit",
            Self::UnitOfWork(_) => "unit_of_work",
            Self::VersionConflict { .. } => "version_conflict",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Backend(_) => "backend",
        }
    }
}
