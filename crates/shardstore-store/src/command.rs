//! The statements the store issues, rendered as PostgreSQL SQL with `$n` parameters.

use std::fmt;

use shardstore_core::Commit;

use crate::backend::SqlValue;
use crate::row_helpers::escape_like;
use crate::schema;

/// Column list shared by the load and insert statements, in row order.
pub const COMMIT_COLUMNS: &str = "id, streamid, items, version, serializer, payload, payload_layout";

/// A commit table: schema plus partition (0 for the unpartitioned table).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub partition: u32,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, partition: u32) -> Self {
        Self {
            schema: schema.into(),
            partition,
        }
    }

    /// Physical table name without the schema.
    pub fn name(&self) -> String {
        schema::table_name(self.partition)
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    LoadStream {
        table: TableRef,
        stream_id: String,
    },
    InsertCommit {
        table: TableRef,
        commit: Commit,
    },
    DeleteStream {
        table: TableRef,
        stream_id: String,
    },
    /// Create the schema (optionally) and the commit tables of the listed partitions.
    EnsureStorage {
        schema: String,
        owner: Option<String>,
        partitions: Vec<u32>,
        create_schema: bool,
    },
    DropSchema {
        schema: String,
    },
    StreamIds {
        table: TableRef,
    },
    Tables {
        schema: String,
        prefix: String,
    },
    Begin,
    CommitTransaction,
    Rollback,
}

impl Command {
    /// Storage for one partition, with the schema created on the way.
    pub fn ensure_partition(schema: &str, owner: Option<&str>, partition: u32) -> Self {
        Self::EnsureStorage {
            schema: schema.to_string(),
            owner: owner.map(str::to_string),
            partitions: vec![partition],
            create_schema: true,
        }
    }

    pub fn sql(&self) -> String {
        match self {
            Self::LoadStream { table, .. } => format!(
                "SELECT {COMMIT_COLUMNS} FROM {table} WHERE streamid = $1 ORDER BY version"
            ),
            Self::InsertCommit { table, .. } => format!(
                "INSERT INTO {table} ({COMMIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ),
            Self::DeleteStream { table, .. } => {
                format!("DELETE FROM {table} WHERE streamid = $1")
            }
            Self::EnsureStorage {
                schema,
                owner,
                partitions,
                create_schema,
            } => schema::ensure_storage(schema, owner.as_deref(), partitions, *create_schema),
            Self::DropSchema { schema } => format!("DROP SCHEMA IF EXISTS {schema} CASCADE"),
            Self::StreamIds { table } => {
                format!("SELECT DISTINCT streamid FROM {table} ORDER BY streamid")
            }
            Self::Tables { .. } => "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' AND table_name LIKE $2 \
                 ORDER BY table_name"
                .to_string(),
            Self::Begin => "BEGIN".to_string(),
            Self::CommitTransaction => "COMMIT".to_string(),
            Self::Rollback => "ROLLBACK".to_string(),
        }
    }

    pub fn params(&self) -> Vec<SqlValue> {
        match self {
            Self::LoadStream { stream_id, .. } | Self::DeleteStream { stream_id, .. } => {
                vec![SqlValue::Text(Some(stream_id.clone()))]
            }
            Self::InsertCommit { commit, .. } => vec![
                SqlValue::Uuid(*commit.id.as_uuid()),
                SqlValue::Text(Some(commit.stream_id.clone())),
                SqlValue::SmallInt(commit.items_count),
                SqlValue::Int(commit.version),
                SqlValue::Text(Some(commit.serializer_id.clone())),
                SqlValue::Bytes(Some(commit.payload.clone())),
                SqlValue::Bytes(commit.payload_layout.clone()),
            ],
            Self::Tables { schema, prefix } => vec![
                SqlValue::Text(Some(schema.clone())),
                SqlValue::Text(Some(format!("{}%", escape_like(prefix)))),
            ],
            _ => Vec::new(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadStream { .. } => "load_stream",
            Self::InsertCommit { .. } => "insert_commit",
            Self::DeleteStream { .. } => "delete_stream",
            Self::EnsureStorage { .. } => "ensure_storage",
            Self::DropSchema { .. } => "drop_schema",
            Self::StreamIds { .. } => "stream_ids",
            Self::Tables { .. } => "tables",
            Self::Begin => "begin",
            Self::CommitTransaction => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// The table a command reads or writes, if it targets a single one.
    pub fn table(&self) -> Option<&TableRef> {
        match self {
            Self::LoadStream { table, .. }
            | Self::InsertCommit { table, .. }
            | Self::DeleteStream { table, .. }
            | Self::StreamIds { table } => Some(table),
            _ => None,
        }
    }
}
