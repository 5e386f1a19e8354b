//! Translation of duplicate-key failures into version conflicts.

use std::sync::LazyLock;

use regex::Regex;

use shardstore_core::{DbError, StoreError};

static CONFLICT_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Key \(streamid, version\)=\((?P<stream>.+), (?P<version>\d+)\) already exists")
        .expect("valid conflict detail regex")
});

/// Pull `(stream_id, version)` out of a unique-violation detail text.
pub fn parse_conflict_detail(detail: &str) -> Option<(String, i32)> {
    let caps = CONFLICT_DETAIL.captures(detail)?;
    let version = caps["version"].parse().ok()?;
    Some((caps["stream"].to_string(), version))
}

/// Build the version conflict for a unique violation on a commit table.
///
/// Unparseable detail still yields a conflict, with no stream id and version 0.
pub fn translate_unique_violation(detail: Option<&str>, table: Option<&str>) -> StoreError {
    let (stream_id, version) = match detail.and_then(parse_conflict_detail) {
        Some((stream, version)) => (Some(stream), version),
        None => (None, 0),
    };
    StoreError::VersionConflict {
        stream_id,
        version,
        detail: table.map(str::to_string),
    }
}

/// Error mapping for a failed insert: duplicates conflict, the rest pass through.
pub fn translate_save_error(err: DbError) -> StoreError {
    match err {
        DbError::UniqueViolation { detail, table, .. } => {
            translate_unique_violation(detail.as_deref(), table.as_deref())
        }
        other => StoreError::Backend(other),
    }
}
