//! PostgreSQL DDL for the commit tables.
//!
//! One table per partition (`commits_<n>`), or a single `commits` table when
//! sharding is off, each with a unique index on `(streamid, version)`.

use shardstore_core::StoreError;

/// Base name of every commit table.
pub const TABLE_PREFIX: &str = "commits";

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Physical table name for a partition; partition 0 is the unpartitioned table.
pub fn table_name(partition: u32) -> String {
    if partition > 0 {
        format!("{TABLE_PREFIX}_{partition}")
    } else {
        TABLE_PREFIX.to_string()
    }
}

/// Schema names are spliced into SQL text unquoted, so only plain lowercase
/// identifiers are allowed. PostgreSQL folds unquoted names to lowercase,
/// and catalog lookups by string literal would miss a mixed-case name.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::Configuration(format!(
            "invalid schema name {name:?}: expected [a-z_][a-z0-9_]* up to {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Create-if-missing block for one commit table, meant to sit inside a `DO $$ ... $$` body.
pub fn create_table_block(schema: &str, partition: u32) -> String {
    let table = table_name(partition);
    format!(
        r#"IF NOT EXISTS (SELECT 1 FROM pg_catalog.pg_class c JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace WHERE n.nspname = '{schema}' AND c.relname = '{table}') THEN
    CREATE TABLE {schema}.{table} (
        id UUID NOT NULL,
        streamid VARCHAR(100) NOT NULL,
        items SMALLINT NOT NULL,
        version INTEGER NOT NULL,
        serializer VARCHAR(20),
        payload BYTEA NOT NULL,
        payload_layout BYTEA,
        created TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
        CONSTRAINT {table}_pk PRIMARY KEY(id)
    );
    CREATE UNIQUE INDEX {table}_streamid_version_uq ON {schema}.{table} USING btree (streamid, version);
END IF;"#
    )
}

/// Schema (optionally) plus the listed partition tables, as one anonymous block.
pub fn ensure_storage(
    schema: &str,
    owner: Option<&str>,
    partitions: &[u32],
    create_schema: bool,
) -> String {
    let mut sql = String::from("DO $$BEGIN\n");
    if create_schema {
        sql.push_str(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"));
        if let Some(owner) = owner {
            sql.push_str(&format!(" AUTHORIZATION {}", quote_ident(owner)));
        }
        sql.push_str(";\n");
    }
    for partition in partitions {
        sql.push_str(&create_table_block(schema, *partition));
        sql.push('\n');
    }
    sql.push_str("END$$;");
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert_eq!(table_name(0), "commits");
        assert_eq!(table_name(12), "commits_12");
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("es").is_ok());
        assert!(validate_identifier("_tenant_01").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("es; DROP TABLE x").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn mixed_case_schema_names_are_rejected() {
        let err = validate_identifier("Tenant").unwrap_err();
        assert!(matches!(err, StoreError::Configuration(ref m) if m.contains("[a-z_][a-z0-9_]*")));
        assert!(validate_identifier("tenant_A").is_err());
        assert!(validate_identifier("tenant").is_ok());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("postgres"), "\"postgres\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn ensure_storage_with_owner() {
        let sql = ensure_storage("es", Some("postgres"), &[3], true);
        assert!(sql.starts_with("DO $$BEGIN\nCREATE SCHEMA IF NOT EXISTS es AUTHORIZATION \"postgres\";"));
        assert!(sql.contains("CREATE TABLE es.commits_3 ("));
        assert!(sql.contains("CREATE UNIQUE INDEX commits_3_streamid_version_uq ON es.commits_3"));
        assert!(sql.ends_with("END$$;"));
    }

    #[test]
    fn ensure_storage_without_owner_or_schema() {
        let sql = ensure_storage("es", None, &[0], true);
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS es;"));
        assert!(!sql.contains("AUTHORIZATION"));
        assert!(sql.contains("c.relname = 'commits'"));

        let sql = ensure_storage("es", Some("postgres"), &[1, 2], false);
        assert!(!sql.contains("CREATE SCHEMA"));
        assert!(sql.contains("es.commits_1"));
        assert!(sql.contains("es.commits_2"));
    }
}
