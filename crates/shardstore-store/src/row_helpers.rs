use bytes::Bytes;
use uuid::Uuid;

use shardstore_core::{Commit, CommitId, StoreError};

use crate::backend::{DbRow, SqlValue};

/// Conversion from a decoded column value. `None` means the value has the wrong type.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> Option<Self>;
}

impl FromSqlValue for Uuid {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Text(Some(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromSqlValue for i16 {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::SmallInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Int(v) => Some(*v),
            SqlValue::SmallInt(v) => Some(i32::from(*v)),
            _ => None,
        }
    }
}

impl FromSqlValue for Bytes {
    fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Bytes(Some(b)) => Some(b.clone()),
            _ => None,
        }
    }
}

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: FromSqlValue>(
    row: &DbRow,
    idx: usize,
    table: &str,
    column: &'static str,
) -> Result<T, StoreError> {
    let value = row.get(idx).ok_or_else(|| StoreError::CorruptRow {
        table: table.to_string(),
        column,
        detail: format!("missing column {idx}"),
    })?;
    if value.is_null() {
        return Err(StoreError::CorruptRow {
            table: table.to_string(),
            column,
            detail: "unexpected NULL".into(),
        });
    }
    T::from_sql_value(value).ok_or_else(|| StoreError::CorruptRow {
        table: table.to_string(),
        column,
        detail: format!("unexpected value {value:?}"),
    })
}

/// Get an optional column value.
pub fn get_opt<T: FromSqlValue>(
    row: &DbRow,
    idx: usize,
    table: &str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    match row.get(idx) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => get(row, idx, table, column).map(Some),
    }
}

/// Decode a row selected with [`crate::command::COMMIT_COLUMNS`].
pub fn row_to_commit(row: &DbRow, table: &str) -> Result<Commit, StoreError> {
    Ok(Commit {
        id: CommitId::from_uuid(get(row, 0, table, "id")?),
        stream_id: get(row, 1, table, "streamid")?,
        items_count: get(row, 2, table, "items")?,
        version: get(row, 3, table, "version")?,
        serializer_id: get_opt(row, 4, table, "serializer")?.unwrap_or_default(),
        payload: get(row, 5, table, "payload")?,
        payload_layout: get_opt(row, 6, table, "payload_layout")?,
    })
}

/// Escape LIKE special characters for safe pattern matching.
pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
